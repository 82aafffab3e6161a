mod client;
mod error;
pub mod model;
pub mod overlap;
pub mod replica;
pub mod sync;

pub use client::{ClientCommand, ClientConfig, ClientHandle, ClientOutcome, ClientWorker};
pub use error::{Result, WorkerErr};

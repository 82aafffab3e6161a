mod error;
pub mod initialization;
pub mod optimization;
pub mod service;
pub mod sparse;
pub mod storage;

pub use error::{Result, ServerErr};

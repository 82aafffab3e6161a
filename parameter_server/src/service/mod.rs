mod builder;
mod handle;
mod server;
mod state;

pub use builder::{ServerBuilder, ShardSpec};
pub use handle::{ServerHandle, ShardStats, panic_message};
pub use server::ServerShardThread;
pub use state::ServerState;

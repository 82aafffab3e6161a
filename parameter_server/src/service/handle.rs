use std::{any::Any, sync::Arc, thread::JoinHandle};

use super::{ServerState, state::SharedState};
use crate::{Result, ServerErr};

/// What a server shard did over the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStats {
    pub updates: u64,
    pub words: u64,
    pub pulls: usize,
}

/// The owning end of a running `ServerShardThread`.
pub struct ServerHandle {
    node: usize,
    state: Arc<SharedState>,
    handle: JoinHandle<Result<ShardStats>>,
}

impl ServerHandle {
    pub(super) fn new(
        node: usize,
        state: Arc<SharedState>,
        handle: JoinHandle<Result<ShardStats>>,
    ) -> Self {
        Self {
            node,
            state,
            handle,
        }
    }

    /// The id of the served shard.
    pub fn node(&self) -> usize {
        self.node
    }

    /// The current state of the server thread.
    pub fn state(&self) -> ServerState {
        self.state.load()
    }

    /// Whether the thread already returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the server thread to return.
    ///
    /// # Returns
    /// The stats of the shard, or the error that stopped it.
    pub fn join(self) -> Result<ShardStats> {
        self.handle
            .join()
            .map_err(|panic| ServerErr::Panicked(panic_message(&*panic)))?
    }
}

/// Extracts the message of a panic payload.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

use std::sync::atomic::{AtomicU8, Ordering};

/// The life cycle of a server shard.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Blocked on the inbox.
    Waiting,
    /// Applying a gradient or serving a pull.
    Processing,
    /// Every node finished, only the final pulls are left.
    Draining,
    /// Every client pulled, the thread is done.
    Stopped,
}

/// A `ServerState` shared between the server thread and its handle.
#[derive(Debug)]
pub(super) struct SharedState(AtomicU8);

impl SharedState {
    pub fn new(state: ServerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ServerState {
        match self.0.load(Ordering::Acquire) {
            0 => ServerState::Waiting,
            1 => ServerState::Processing,
            2 => ServerState::Draining,
            _ => ServerState::Stopped,
        }
    }

    pub fn store(&self, state: ServerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

use std::{
    sync::mpsc::{self, RecvTimeoutError, TryRecvError},
    time::Duration,
};

use crate::transport::Envelope;

/// The producing side of an `Inbox`, cloned once per incoming link.
pub type Feed = mpsc::Sender<Envelope>;

/// A single queue that merges the messages of many incoming links.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<Envelope>,
}

/// Creates a new `Inbox` together with the `Feed` that fills it.
pub fn inbox() -> (Feed, Inbox) {
    let (tx, rx) = mpsc::channel();
    (tx, Inbox { rx })
}

impl Inbox {
    /// Blocks until a message arrives.
    ///
    /// # Returns
    /// `None` once every feed has been dropped and the queue is empty.
    pub fn recv(&self) -> Option<Envelope> {
        self.rx.recv().ok()
    }

    /// Returns the next queued message without blocking.
    ///
    /// # Returns
    /// `Ok(None)` if nothing is queued, `Err(Disconnected)` if every feed was dropped.
    pub fn try_recv(&self) -> Result<Option<Envelope>, Disconnected> {
        match self.rx.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Disconnected),
        }
    }

    /// Blocks for at most `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>, Disconnected> {
        match self.rx.recv_timeout(timeout) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Disconnected),
        }
    }
}

/// Every feed of an inbox has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

impl std::fmt::Display for Disconnected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "every feed of the inbox was dropped")
    }
}

impl std::error::Error for Disconnected {}

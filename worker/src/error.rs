use std::{error::Error, fmt, io};

use parameter_server::storage::SizeMismatchErr;

use crate::model::ModelErr;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Client runtime failures, all of them fatal to the run.
#[derive(Debug)]
pub enum WorkerErr {
    /// A link failed to deliver or reported a broken stream.
    Transport(io::Error),
    /// A shard answered with something the client didn't ask for.
    Protocol {
        client: usize,
        shard: usize,
        tag: &'static str,
        detail: String,
    },
    /// A local buffer didn't match the slice it was meant for.
    Shard(SizeMismatchErr),
    /// The model failed to compute, save or load.
    Model(ModelErr),
    /// The client can't be set up with the given options.
    Config(String),
    /// A client or communication thread is gone.
    Disconnected(String),
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Transport(e) => write!(f, "transport failure: {e}"),
            WorkerErr::Protocol {
                client,
                shard,
                tag,
                detail,
            } => write!(
                f,
                "protocol violation between client {client} and shard {shard} ({tag}): {detail}"
            ),
            WorkerErr::Shard(e) => write!(f, "size mismatch: {e}"),
            WorkerErr::Model(e) => write!(f, "model error: {e}"),
            WorkerErr::Config(detail) => write!(f, "invalid configuration: {detail}"),
            WorkerErr::Disconnected(detail) => write!(f, "disconnected: {detail}"),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Transport(e) => Some(e),
            WorkerErr::Shard(e) => Some(e),
            WorkerErr::Model(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Transport(value)
    }
}

impl From<SizeMismatchErr> for WorkerErr {
    fn from(value: SizeMismatchErr) -> Self {
        Self::Shard(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Transport(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

use std::{error::Error, fmt, io};

use parameter_server::{ServerErr, initialization::ParamGenErr};
use worker::WorkerErr;

/// The node module's result type.
pub type Result<T> = std::result::Result<T, NodeErr>;

/// Failures of a node, from wiring the topology to shutting it down.
#[derive(Debug)]
pub enum NodeErr {
    /// The configuration or the topology it describes is unusable.
    Config(String),
    /// A link couldn't be established or broke.
    Transport(io::Error),
    /// The server shard of the node failed.
    Server(ServerErr),
    /// A client of the node failed.
    Worker(WorkerErr),
    /// A local file couldn't be read or written.
    Io(io::Error),
}

impl fmt::Display for NodeErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeErr::Config(detail) => write!(f, "configuration error: {detail}"),
            NodeErr::Transport(e) => write!(f, "transport failure: {e}"),
            NodeErr::Server(e) => write!(f, "server failure: {e}"),
            NodeErr::Worker(e) => write!(f, "client failure: {e}"),
            NodeErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for NodeErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NodeErr::Config(_) => None,
            NodeErr::Transport(e) | NodeErr::Io(e) => Some(e),
            NodeErr::Server(e) => Some(e),
            NodeErr::Worker(e) => Some(e),
        }
    }
}

impl From<io::Error> for NodeErr {
    fn from(value: io::Error) -> Self {
        Self::Transport(value)
    }
}

impl From<ServerErr> for NodeErr {
    fn from(value: ServerErr) -> Self {
        match value {
            ServerErr::Config(detail) => Self::Config(detail),
            other => Self::Server(other),
        }
    }
}

impl From<WorkerErr> for NodeErr {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Config(detail) => Self::Config(detail),
            other => Self::Worker(other),
        }
    }
}

impl From<ParamGenErr> for NodeErr {
    fn from(value: ParamGenErr) -> Self {
        Self::Config(format!("failed to generate the initial parameters: {value}"))
    }
}

impl From<serde_json::Error> for NodeErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Config(format!("malformed configuration: {value}"))
    }
}

/// Boundary conversion for the binary.
impl From<NodeErr> for io::Error {
    fn from(value: NodeErr) -> Self {
        match value {
            NodeErr::Transport(e) | NodeErr::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}

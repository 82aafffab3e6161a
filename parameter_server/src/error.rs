use std::{error::Error, fmt, io};

use comms::LinkId;

use crate::{
    sparse::DropRateErr,
    storage::{PartitionErr, SizeMismatchErr},
};

/// The parameter server's result type.
pub type Result<T> = std::result::Result<T, ServerErr>;

/// Failures of a server shard, all of them fatal to the run.
#[derive(Debug)]
pub enum ServerErr {
    /// A link failed to deliver or reported a broken stream.
    Transport(io::Error),
    /// A peer broke the exchange protocol.
    Protocol {
        shard: usize,
        link: LinkId,
        tag: &'static str,
        detail: String,
    },
    /// A buffer didn't match the slice it was meant for.
    SizeMismatch(SizeMismatchErr),
    /// The shard can't be set up with the given topology or options.
    Config(String),
    /// The server thread panicked.
    Panicked(String),
}

impl fmt::Display for ServerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport failure: {e}"),
            Self::Protocol {
                shard,
                link,
                tag,
                detail,
            } => write!(
                f,
                "protocol violation at shard {shard} on link {link} ({tag}): {detail}"
            ),
            Self::SizeMismatch(e) => write!(f, "size mismatch: {e}"),
            Self::Config(detail) => write!(f, "invalid configuration: {detail}"),
            Self::Panicked(detail) => write!(f, "server thread panicked: {detail}"),
        }
    }
}

impl Error for ServerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::SizeMismatch(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerErr {
    fn from(value: io::Error) -> Self {
        Self::Transport(value)
    }
}

impl From<SizeMismatchErr> for ServerErr {
    fn from(value: SizeMismatchErr) -> Self {
        Self::SizeMismatch(value)
    }
}

impl From<PartitionErr> for ServerErr {
    fn from(value: PartitionErr) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<DropRateErr> for ServerErr {
    fn from(value: DropRateErr) -> Self {
        Self::Config(value.to_string())
    }
}

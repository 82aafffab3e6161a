mod error;
mod partition;
mod shard;

pub use error::{Result, SizeMismatchErr};
pub use partition::{Partition, PartitionErr};
pub use shard::ParameterShard;

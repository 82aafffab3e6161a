//! The push gradient / pull parameters exchange between one client and every shard.

mod dense;
mod links;
mod sparse;

use parking_lot::Mutex;

pub use dense::DenseSync;
pub use links::ShardLinks;
pub use sparse::SparseSync;

use crate::Result;

/// Exchanges a client's gradient for fresh parameters with every shard.
pub trait Synchronizer: Send {
    /// Pushes `grad` to every shard and writes what they answer into `params`.
    ///
    /// # Arguments
    /// * `grad` - The full gradient of the client.
    /// * `params` - The full parameters of the client.
    /// * `batch_words` - The amount of words behind `grad`.
    /// * `channel` - A lock held for the whole exchange when links are shared.
    fn synchronize(
        &mut self,
        grad: &[f32],
        params: &mut [f32],
        batch_words: u64,
        channel: Option<&Mutex<()>>,
    ) -> Result<()>;

    /// Replaces `params` with the final state of every shard.
    fn pull(&mut self, params: &mut [f32]) -> Result<()>;
}

impl<S: Synchronizer + ?Sized> Synchronizer for Box<S> {
    fn synchronize(
        &mut self,
        grad: &[f32],
        params: &mut [f32],
        batch_words: u64,
        channel: Option<&Mutex<()>>,
    ) -> Result<()> {
        (**self).synchronize(grad, params, batch_words, channel)
    }

    fn pull(&mut self, params: &mut [f32]) -> Result<()> {
        (**self).pull(params)
    }
}

//! The capabilities the client runtime needs from the model and the data pipeline.

use std::{error::Error, path::Path};

/// The error type of the model collaborator.
pub type ModelErr = Box<dyn Error + Send + Sync>;

/// A training batch.
pub trait Batch: Send + 'static {
    /// The amount of target words, used to scale the learning rate.
    fn words(&self) -> u64;

    /// The amount of samples.
    fn size(&self) -> usize;
}

/// What a single gradient computation reported.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchStats {
    pub loss: f32,
    pub words: u64,
}

/// Running statistics of a model instance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelStats {
    pub batches: u64,
    pub words: u64,
    pub loss_sum: f64,
}

impl ModelStats {
    /// Folds the result of one batch in.
    pub fn record(&mut self, stats: BatchStats) {
        self.batches += 1;
        self.words += stats.words;
        self.loss_sum += f64::from(stats.loss);
    }

    pub fn mean_loss(&self) -> Option<f64> {
        (self.batches > 0).then(|| self.loss_sum / self.batches as f64)
    }
}

/// A model replica on one device.
///
/// It doesn't own its parameters, the client hands them in on every call.
pub trait Model<B: Batch>: Send + 'static {
    /// The amount of parameters of the model.
    fn size(&self) -> usize;

    /// Runs the forward and backward passes over `batch`.
    ///
    /// # Arguments
    /// * `batch` - The batch to train on.
    /// * `params` - The current parameters of the replica.
    /// * `grad` - Where to write the gradient, overwritten entirely.
    fn compute_gradients(
        &mut self,
        batch: &B,
        params: &[f32],
        grad: &mut [f32],
    ) -> Result<BatchStats, ModelErr>;

    /// Writes `params` as a checkpoint at `path`.
    fn save(&self, path: &Path, params: &[f32]) -> Result<(), ModelErr>;

    /// Reads the parameters of a checkpoint at `path`.
    fn load(&self, path: &Path) -> Result<Vec<f32>, ModelErr>;

    /// Statistics about the work done so far.
    fn collect_stats(&self) -> ModelStats;
}

/// A pull based supplier of batches.
pub trait BatchSource<B> {
    /// Returns the next batch, `None` once exhausted.
    fn next_batch(&mut self) -> Option<B>;
}

impl<B, I: Iterator<Item = B>> BatchSource<B> for I {
    fn next_batch(&mut self) -> Option<B> {
        self.next()
    }
}

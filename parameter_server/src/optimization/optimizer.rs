use std::num::NonZeroUsize;

use crate::storage::Result;

/// Defines the strategy for updating model parameters based on calculated gradients.
pub trait Optimizer {
    /// Updates the provided slice of parameters using the given gradient.
    ///
    /// # Arguments
    /// * `grad` - A reference to the model's gradient.
    /// * `params` - The parameters to update.
    /// * `batch_words` - The amount of words behind `grad`, zero if unknown.
    ///
    /// # Returns
    /// An error if there's a mismatch in the sizes of `grad` and `params`.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32], batch_words: u64) -> Result<()>;
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32], batch_words: u64) -> Result<()> {
        (**self).update_params(grad, params, batch_words)
    }
}

/// A learning rate that optionally scales with the size of the batch behind each update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRate {
    base: f32,
    reference_words: Option<NonZeroUsize>,
}

impl LearningRate {
    /// Creates a new `LearningRate`.
    ///
    /// # Arguments
    /// * `base` - The rate used for a batch of `reference_words` words.
    /// * `reference_words` - The batch size `base` was tuned for, `None` for a fixed rate.
    pub fn new(base: f32, reference_words: Option<NonZeroUsize>) -> Self {
        Self {
            base,
            reference_words,
        }
    }

    /// Creates a fixed `LearningRate`.
    pub fn fixed(base: f32) -> Self {
        Self::new(base, None)
    }

    /// The effective rate for an update computed over `batch_words` words.
    ///
    /// A zero word count falls back to the base rate.
    pub fn at(&self, batch_words: u64) -> f32 {
        match self.reference_words {
            Some(reference) if batch_words > 0 => {
                (f64::from(self.base) * batch_words as f64 / reference.get() as f64) as f32
            }
            _ => self.base,
        }
    }
}

impl From<f32> for LearningRate {
    fn from(base: f32) -> Self {
        Self::fixed(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_with_batch_words() {
        let lr = LearningRate::new(0.1, NonZeroUsize::new(100));

        assert_eq!(lr.at(100), 0.1);
        assert_eq!(lr.at(200), 0.2);
        assert_eq!(lr.at(0), 0.1);
        assert_eq!(LearningRate::fixed(0.3).at(1000), 0.3);
    }
}

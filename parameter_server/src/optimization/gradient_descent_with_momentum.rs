use super::{LearningRate, Optimizer};
use crate::storage::{Result, SizeMismatchErr};

#[derive(Debug)]
pub struct GradientDescentWithMomentum {
    learning_rate: LearningRate,
    momentum: f32,
    velocity: Box<[f32]>,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - Hyperparameter to the optimization algorithm.
    ///
    /// # Returns
    /// A new `GradientDescentWithMomentum` instance.
    pub fn new(len: usize, learning_rate: impl Into<LearningRate>, momentum: f32) -> Self {
        Self {
            learning_rate: learning_rate.into(),
            momentum,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32], batch_words: u64) -> Result<()> {
        SizeMismatchErr::check(params.len(), grad.len())?;
        SizeMismatchErr::check(self.velocity.len(), params.len())?;

        let lr = self.learning_rate.at(batch_words);
        let mu = self.momentum;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                *v = (mu * *v) + g;
                *p -= lr * *v;
            });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_carries_over() {
        let mut optimizer = GradientDescentWithMomentum::new(1, 1., 0.5);
        let mut params = [0.];

        optimizer.update_params(&[1.], &mut params, 0).unwrap();
        assert_eq!(params, [-1.]);

        optimizer.update_params(&[0.], &mut params, 0).unwrap();
        assert_eq!(params, [-1.5]);
    }
}

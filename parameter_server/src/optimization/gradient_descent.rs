use super::{LearningRate, Optimizer};
use crate::storage::{Result, SizeMismatchErr};

#[derive(Debug)]
pub struct GradientDescent {
    learning_rate: LearningRate,
}

impl GradientDescent {
    /// Creates a new `GradientDescent` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    ///
    /// # Returns
    /// A new `GradientDescent` instance.
    pub fn new(learning_rate: impl Into<LearningRate>) -> Self {
        Self {
            learning_rate: learning_rate.into(),
        }
    }
}

impl Optimizer for GradientDescent {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32], batch_words: u64) -> Result<()> {
        SizeMismatchErr::check(params.len(), grad.len())?;

        let lr = self.learning_rate.at(batch_words);

        for (p, g) in params.iter_mut().zip(grad) {
            *p -= lr * g;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_against_the_gradient() {
        let mut optimizer = GradientDescent::new(0.5);
        let mut params = [1., 1.];

        optimizer.update_params(&[2., -2.], &mut params, 0).unwrap();
        assert_eq!(params, [0., 2.]);

        assert!(optimizer.update_params(&[1.], &mut params, 0).is_err());
    }
}

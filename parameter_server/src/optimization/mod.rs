mod adam;
mod gradient_descent;
mod gradient_descent_with_momentum;
mod optimizer;

use std::num::NonZeroUsize;

use comms::specs::OptimizerSpec;

pub use adam::Adam;
pub use gradient_descent::GradientDescent;
pub use gradient_descent_with_momentum::GradientDescentWithMomentum;
pub use optimizer::{LearningRate, Optimizer};

/// Creates a type erased optimizer following a spec.
///
/// # Arguments
/// * `spec` - The specification of the optimizer.
/// * `len` - The amount of parameters the optimizer will update.
/// * `reference_words` - The batch size the learning rate was tuned for, if any.
///
/// # Returns
/// A boxed optimizer.
pub fn boxed(
    spec: OptimizerSpec,
    len: usize,
    reference_words: Option<NonZeroUsize>,
) -> Box<dyn Optimizer + Send> {
    match spec {
        OptimizerSpec::Adam {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        } => {
            let lr = LearningRate::new(learning_rate, reference_words);
            Box::new(Adam::new(len, lr, beta1, beta2, epsilon))
        }
        OptimizerSpec::GradientDescent { learning_rate } => {
            let lr = LearningRate::new(learning_rate, reference_words);
            Box::new(GradientDescent::new(lr))
        }
        OptimizerSpec::GradientDescentWithMomentum {
            learning_rate,
            momentum,
        } => {
            let lr = LearningRate::new(learning_rate, reference_words);
            Box::new(GradientDescentWithMomentum::new(len, lr, momentum))
        }
    }
}

//! Gradient dropping: top-k selection with error feedback for both directions of the exchange.

mod codec;
mod tensor;
mod top_k;

pub use codec::{GradientDropper, SparseCodec};
pub use tensor::SparseTensor;
pub use top_k::{DropRateErr, TopK};

mod builder;
mod chained;
mod constant;
mod error;
mod param_gen;
mod random;

pub use builder::generate;
pub use chained::ChainedParamGen;
pub use constant::ConstParamGen;
pub use error::{ParamGenErr, Result};
pub use param_gen::ParamGen;
pub use random::RandParamGen;

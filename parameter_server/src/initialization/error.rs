use std::{
    error::Error,
    fmt::{self, Display},
};

use rand_distr::{NormalError, uniform::Error as UniformError};

/// The specific result type for parameter initialization.
pub type Result<T> = std::result::Result<T, ParamGenErr>;

/// Error returned while building the initial parameters.
#[derive(Debug)]
pub enum ParamGenErr {
    /// A distribution rejected its arguments.
    Distribution(String),
    /// The generator produced a different amount of parameters than the model holds.
    Length { expected: usize, got: usize },
}

impl From<NormalError> for ParamGenErr {
    fn from(value: NormalError) -> Self {
        Self::Distribution(value.to_string())
    }
}

impl From<UniformError> for ParamGenErr {
    fn from(value: UniformError) -> Self {
        Self::Distribution(value.to_string())
    }
}

impl Display for ParamGenErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Distribution(detail) => write!(f, "invalid distribution: {detail}"),
            Self::Length { expected, got } => write!(
                f,
                "the parameter generator produced {got} values for a model of {expected}"
            ),
        }
    }
}

impl Error for ParamGenErr {}

use std::{
    error::Error,
    fmt::{self, Display},
};

/// The specific result type for size mismatch checks inside the storage module.
pub type Result<T> = std::result::Result<T, SizeMismatchErr>;

/// Error returned by the storage and optimization code whenever a gradient, a set of
/// parameters or an external buffer doesn't line up with the slice it's meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeMismatchErr {
    pub expected: usize,
    pub got: usize,
}

impl SizeMismatchErr {
    /// Checks that `got` matches `expected`.
    pub fn check(expected: usize, got: usize) -> Result<()> {
        if expected != got {
            return Err(Self { expected, got });
        }

        Ok(())
    }
}

impl Display for SizeMismatchErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the provided buffer has {} entries but the slice holds {}",
            self.got, self.expected
        )
    }
}

impl Error for SizeMismatchErr {}

use crate::storage::{Result, SizeMismatchErr};

/// A sparse view over a dense slice of `len` entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseTensor {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
    pub len: usize,
}

impl SparseTensor {
    /// Creates an empty `SparseTensor` over `len` entries.
    pub fn empty(len: usize) -> Self {
        Self {
            indices: Vec::new(),
            values: Vec::new(),
            len,
        }
    }

    /// Checks that the pairs line up and the indices are strictly ascending and in bounds.
    pub fn validate(indices: &[u32], values: &[f32], len: usize) -> std::result::Result<(), String> {
        if indices.len() != values.len() {
            return Err(format!(
                "{} indices but {} values",
                indices.len(),
                values.len()
            ));
        }

        if let Some(w) = indices.windows(2).find(|w| w[0] >= w[1]) {
            return Err(format!("indices not ascending at {} -> {}", w[0], w[1]));
        }

        match indices.last() {
            Some(&last) if last as usize >= len => {
                Err(format!("index {last} out of a slice of {len} entries"))
            }
            _ => Ok(()),
        }
    }

    /// Adds the values onto `dense` at their indices.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `dense` isn't `len` entries long.
    pub fn add_to(&self, dense: &mut [f32]) -> Result<()> {
        SizeMismatchErr::check(self.len, dense.len())?;

        for (&i, v) in self.indices.iter().zip(&self.values) {
            dense[i as usize] += v;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_catches_bad_pairs() {
        assert!(SparseTensor::validate(&[0, 2], &[1., 1.], 3).is_ok());
        assert!(SparseTensor::validate(&[0, 3], &[1., 1.], 3).is_err());
        assert!(SparseTensor::validate(&[2, 2], &[1., 1.], 3).is_err());
        assert!(SparseTensor::validate(&[0], &[1., 1.], 3).is_err());
    }

    #[test]
    fn add_to_leaves_other_entries_alone() {
        let sparse = SparseTensor {
            indices: vec![1, 3],
            values: vec![0.5, -1.],
            len: 4,
        };

        let mut dense = [1.; 4];
        sparse.add_to(&mut dense).unwrap();
        assert_eq!(dense, [1., 1.5, 1., 0.]);
    }
}

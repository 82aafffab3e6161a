use std::ops::Range;

use super::{Result, SizeMismatchErr};

/// A fixed split of `len` contiguous entries into `parts` balanced, non overlapping slices.
///
/// The first `len % parts` slices hold one extra entry. The split is computed once and
/// every offset in the system is derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    len: usize,
    parts: usize,
}

/// Error returned when a partition can't give every part at least one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionErr {
    pub len: usize,
    pub parts: usize,
}

impl std::fmt::Display for PartitionErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "can't split {} entries into {} non empty parts",
            self.len, self.parts
        )
    }
}

impl std::error::Error for PartitionErr {}

impl Partition {
    /// Creates a new `Partition`.
    ///
    /// # Arguments
    /// * `len` - The total amount of entries.
    /// * `parts` - The amount of slices.
    ///
    /// # Returns
    /// A `PartitionErr` if `parts` is zero or bigger than `len`.
    pub fn new(len: usize, parts: usize) -> std::result::Result<Self, PartitionErr> {
        if parts == 0 || len < parts {
            return Err(PartitionErr { len, parts });
        }

        Ok(Self { len, parts })
    }

    /// The total amount of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// The amount of slices.
    pub fn parts(&self) -> usize {
        self.parts
    }

    /// Returns the offset and length of the `part`-th slice.
    ///
    /// # Panics
    /// If `part` is out of bounds.
    pub fn slice_for(&self, part: usize) -> (usize, usize) {
        assert!(part < self.parts, "part {part} out of {}", self.parts);

        let base = self.len / self.parts;
        let extra = self.len % self.parts;
        let offset = part * base + part.min(extra);
        let len = base + usize::from(part < extra);

        (offset, len)
    }

    /// Returns the range of entries of the `part`-th slice.
    pub fn range(&self, part: usize) -> Range<usize> {
        let (offset, len) = self.slice_for(part);
        offset..offset + len
    }

    /// Finds the slice holding entry `index`.
    pub fn part_of(&self, index: usize) -> Option<usize> {
        if index >= self.len {
            return None;
        }

        let base = self.len / self.parts;
        let extra = self.len % self.parts;
        let wide = extra * (base + 1);

        let part = if index < wide {
            index / (base + 1)
        } else {
            extra + (index - wide) / base
        };

        Some(part)
    }

    /// Splits `data` into one slice per part.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `data` isn't exactly `len` entries long.
    pub fn split<'a, T>(&self, data: &'a [T]) -> Result<Vec<&'a [T]>> {
        SizeMismatchErr::check(self.len, data.len())?;
        Ok((0..self.parts).map(|part| &data[self.range(part)]).collect())
    }

    /// Splits `data` into one mutable slice per part.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `data` isn't exactly `len` entries long.
    pub fn split_mut<'a, T>(&self, mut data: &'a mut [T]) -> Result<Vec<&'a mut [T]>> {
        SizeMismatchErr::check(self.len, data.len())?;

        let mut slices = Vec::with_capacity(self.parts);
        for part in 0..self.parts {
            let (_, len) = self.slice_for(part);
            let (head, tail) = data.split_at_mut(len);
            slices.push(head);
            data = tail;
        }

        Ok(slices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_cover_everything_once() {
        for len in 1..40 {
            for parts in 1..=len.min(9) {
                let partition = Partition::new(len, parts).unwrap();
                let mut seen = vec![0; len];

                for part in 0..parts {
                    for i in partition.range(part) {
                        seen[i] += 1;
                        assert_eq!(partition.part_of(i), Some(part));
                    }
                }

                assert!(seen.iter().all(|&n| n == 1), "len {len} parts {parts}");
                assert_eq!(partition.part_of(len), None);
            }
        }
    }

    #[test]
    fn first_parts_take_the_remainder() {
        let partition = Partition::new(10, 3).unwrap();

        assert_eq!(partition.slice_for(0), (0, 4));
        assert_eq!(partition.slice_for(1), (4, 3));
        assert_eq!(partition.slice_for(2), (7, 3));
    }

    #[test]
    fn rejects_degenerate_splits() {
        assert!(Partition::new(5, 0).is_err());
        assert_eq!(
            Partition::new(2, 3).unwrap_err(),
            PartitionErr { len: 2, parts: 3 }
        );
    }

    #[test]
    fn split_mut_writes_through() {
        let partition = Partition::new(5, 2).unwrap();
        let mut data = [0; 5];

        for (part, slice) in partition.split_mut(&mut data).unwrap().into_iter().enumerate() {
            slice.fill(part + 1);
        }

        assert_eq!(data, [1, 1, 1, 2, 2]);
        assert!(partition.split(&data[..4]).is_err());
    }
}

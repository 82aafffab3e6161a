use std::cmp::Ordering;

/// Selects the largest magnitude entries of a slice, keeping a fixed fraction of them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopK {
    drop_rate: f32,
}

/// Error returned when the drop rate leaves nothing to send or drops nothing at all.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropRateErr(pub f32);

impl std::fmt::Display for DropRateErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "drop rate {} must lie in (0, 1)", self.0)
    }
}

impl std::error::Error for DropRateErr {}

impl TopK {
    /// Creates a new `TopK` selector.
    ///
    /// # Arguments
    /// * `drop_rate` - The fraction of entries to leave out, must lie in `(0, 1)`.
    ///
    /// # Returns
    /// A `DropRateErr` if `drop_rate` is out of range.
    pub fn new(drop_rate: f32) -> Result<Self, DropRateErr> {
        if !(drop_rate > 0. && drop_rate < 1.) {
            return Err(DropRateErr(drop_rate));
        }

        Ok(Self { drop_rate })
    }

    pub fn drop_rate(&self) -> f32 {
        self.drop_rate
    }

    /// The amount of entries kept out of `len`, `ceil((1 - drop_rate) * len)`.
    ///
    /// Products within float noise of a whole number aren't rounded up. A non empty
    /// slice always keeps at least one entry.
    pub fn k(&self, len: usize) -> usize {
        let kept = (1. - f64::from(self.drop_rate)) * len as f64;
        let rounded = kept.round();

        let k = if (kept - rounded).abs() < 1e-4 {
            rounded
        } else {
            kept.ceil()
        };

        (k as usize).clamp(len.min(1), len)
    }

    /// Selects the `k(values.len())` entries of largest magnitude.
    ///
    /// Ties are broken in favor of the lower index.
    ///
    /// # Returns
    /// The selected indices in ascending order.
    pub fn select(&self, values: &[f32]) -> Vec<u32> {
        let k = self.k(values.len());
        let mut order: Vec<u32> = (0..values.len() as u32).collect();

        let by_magnitude = |a: &u32, b: &u32| -> Ordering {
            let (va, vb) = (values[*a as usize].abs(), values[*b as usize].abs());
            vb.total_cmp(&va).then(a.cmp(b))
        };

        if k < order.len() && k > 0 {
            order.select_nth_unstable_by(k - 1, by_magnitude);
        }

        order.truncate(k);
        order.sort_unstable();
        order
    }
}

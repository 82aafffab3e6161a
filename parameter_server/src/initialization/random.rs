use std::{cell::RefCell, rc::Rc};

use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use super::{ParamGen, Result};

/// A parameter generator drawing from a probability distribution.
///
/// The rng is shared so that chained generators consume one seeded stream in order,
/// which keeps the initial parameters identical on every node.
pub struct RandParamGen<R: Rng, D: Distribution<f32>> {
    rng: Rc<RefCell<R>>,
    distribution: D,
    remaining: usize,
}

impl<R: Rng, D: Distribution<f32>> RandParamGen<R, D> {
    /// Creates a new `RandParamGen`.
    ///
    /// # Arguments
    /// * `rng` - The shared random number generator.
    /// * `distribution` - The distribution to sample from.
    /// * `limit` - How many values to generate before being exhausted.
    pub fn new(rng: Rc<RefCell<R>>, distribution: D, limit: usize) -> Self {
        Self {
            rng,
            distribution,
            remaining: limit,
        }
    }
}

impl<R: Rng> RandParamGen<R, Uniform<f32>> {
    /// Uniform over `[low, high)`, fails if the range is empty.
    pub fn uniform(rng: Rc<RefCell<R>>, limit: usize, low: f32, high: f32) -> Result<Self> {
        Ok(Self::new(rng, Uniform::new(low, high)?, limit))
    }

    /// Uniform over `[low, high]`, fails if `low > high`.
    pub fn uniform_inclusive(
        rng: Rc<RefCell<R>>,
        limit: usize,
        low: f32,
        high: f32,
    ) -> Result<Self> {
        Ok(Self::new(rng, Uniform::new_inclusive(low, high)?, limit))
    }

    /// Xavier uniform initialization, `±sqrt(6 / (fan_in + fan_out))`.
    pub fn xavier_uniform(
        rng: Rc<RefCell<R>>,
        limit: usize,
        fan_in: usize,
        fan_out: usize,
    ) -> Result<Self> {
        let range = (6. / (fan_in + fan_out) as f32).sqrt();
        Self::uniform(rng, limit, -range, range)
    }

    /// LeCun uniform initialization, `±sqrt(3 / fan_in)`.
    pub fn lecun_uniform(rng: Rc<RefCell<R>>, limit: usize, fan_in: usize) -> Result<Self> {
        let range = (3. / fan_in as f32).sqrt();
        Self::uniform(rng, limit, -range, range)
    }
}

impl<R: Rng> RandParamGen<R, Normal<f32>> {
    /// Normal distribution, fails if `std_dev` isn't finite.
    pub fn normal(rng: Rc<RefCell<R>>, limit: usize, mean: f32, std_dev: f32) -> Result<Self> {
        Ok(Self::new(rng, Normal::new(mean, std_dev)?, limit))
    }

    /// Kaiming normal initialization, `N(0, 2 / fan_in)`.
    pub fn kaiming(rng: Rc<RefCell<R>>, limit: usize, fan_in: usize) -> Result<Self> {
        let std_dev = (2. / fan_in as f32).sqrt();
        Self::normal(rng, limit, 0., std_dev)
    }

    /// Xavier normal initialization, `N(0, 2 / (fan_in + fan_out))`.
    pub fn xavier(
        rng: Rc<RefCell<R>>,
        limit: usize,
        fan_in: usize,
        fan_out: usize,
    ) -> Result<Self> {
        Self::kaiming(rng, limit, fan_in + fan_out)
    }

    /// LeCun normal initialization, `N(0, 1 / fan_in)`.
    pub fn lecun(rng: Rc<RefCell<R>>, limit: usize, fan_in: usize) -> Result<Self> {
        let std_dev = (1. / fan_in as f32).sqrt();
        Self::normal(rng, limit, 0., std_dev)
    }
}

impl<R: Rng, D: Distribution<f32>> ParamGen for RandParamGen<R, D> {
    fn sample(&mut self, n: usize) -> Option<Vec<f32>> {
        let n = n.min(self.remaining);
        if n == 0 {
            return None;
        }

        self.remaining -= n;

        let mut rng = self.rng.borrow_mut();
        let sample = (0..n).map(|_| self.distribution.sample(&mut *rng)).collect();
        Some(sample)
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn seeded_rng() -> Rc<RefCell<StdRng>> {
        Rc::new(RefCell::new(StdRng::seed_from_u64(42)))
    }

    #[test]
    fn same_seed_same_values() {
        let mut a = RandParamGen::normal(seeded_rng(), 10, 0., 1.).unwrap();
        let mut b = RandParamGen::normal(seeded_rng(), 10, 0., 1.).unwrap();

        let sample = a.sample(7).unwrap();
        assert_eq!(sample, b.sample(7).unwrap());
        assert_eq!(a.sample(7).unwrap().len(), 3);
        assert!(a.sample(1).is_none());
    }

    #[test]
    fn uniform_stays_in_range() {
        let mut param_gen = RandParamGen::uniform(seeded_rng(), 100, -1., 1.).unwrap();
        let sample = param_gen.collect_all();

        assert_eq!(sample.len(), 100);
        assert!(sample.iter().all(|x| (-1. ..1.).contains(x)));
        assert!(RandParamGen::uniform(seeded_rng(), 1, 1., -1.).is_err());
    }
}

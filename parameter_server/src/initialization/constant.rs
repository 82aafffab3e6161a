use super::ParamGen;

/// A parameter generator that repeats one value a limited amount of times.
pub struct ConstParamGen {
    value: f32,
    remaining: usize,
}

impl ConstParamGen {
    /// Creates a new `ConstParamGen`.
    ///
    /// # Arguments
    /// * `value` - The value to generate.
    /// * `limit` - How many values to generate before being exhausted.
    pub fn new(value: f32, limit: usize) -> Self {
        Self {
            value,
            remaining: limit,
        }
    }
}

impl ParamGen for ConstParamGen {
    fn sample(&mut self, n: usize) -> Option<Vec<f32>> {
        let n = n.min(self.remaining);
        if n == 0 {
            return None;
        }

        self.remaining -= n;
        Some(vec![self.value; n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_at_the_limit() {
        let mut param_gen = ConstParamGen::new(1., 10);

        assert_eq!(param_gen.sample(7).unwrap(), vec![1.; 7]);
        assert_eq!(param_gen.sample(7).unwrap(), vec![1.; 3]);
        assert!(param_gen.sample(1).is_none());
        assert!(ConstParamGen::new(1., 0).sample(1).is_none());
    }
}

use super::ParamGen;

/// A parameter generator that runs a list of generators one after the other.
///
/// Handy for giving each layer of a model its own initialization, every inner generator
/// knows how many parameters it's responsible for.
pub struct ChainedParamGen {
    param_gens: Vec<Box<dyn ParamGen>>,
    curr: usize,
}

impl ChainedParamGen {
    /// Creates a new `ChainedParamGen`.
    ///
    /// # Arguments
    /// * `param_gens` - The generators, in order.
    pub fn new(param_gens: Vec<Box<dyn ParamGen>>) -> Self {
        Self {
            param_gens,
            curr: 0,
        }
    }
}

impl ParamGen for ChainedParamGen {
    fn sample(&mut self, n: usize) -> Option<Vec<f32>> {
        let mut sample = Vec::with_capacity(n);

        while sample.len() < n {
            let Some(param_gen) = self.param_gens.get_mut(self.curr) else {
                break;
            };

            match param_gen.sample(n - sample.len()) {
                Some(part) => sample.extend(part),
                None => self.curr += 1,
            }
        }

        (!sample.is_empty()).then_some(sample)
    }
}

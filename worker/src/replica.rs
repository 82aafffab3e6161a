use parameter_server::storage::{Result, SizeMismatchErr};

/// A running sum of gradients and the words behind them.
#[derive(Debug, Clone)]
pub struct GradSum {
    pub sum: Vec<f32>,
    pub words: u64,
    pub steps: usize,
}

impl GradSum {
    pub fn new(len: usize) -> Self {
        Self {
            sum: vec![0.; len],
            words: 0,
            steps: 0,
        }
    }

    /// Adds one step's gradient.
    pub fn add(&mut self, grad: &[f32], words: u64) -> Result<()> {
        SizeMismatchErr::check(self.sum.len(), grad.len())?;

        self.sum.iter_mut().zip(grad).for_each(|(s, g)| *s += g);
        self.words += words;
        self.steps += 1;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.steps == 0
    }

    /// Zeroes the sum and the counters, keeping the allocation.
    pub fn clear(&mut self) {
        self.sum.fill(0.);
        self.words = 0;
        self.steps = 0;
    }
}

/// An exponential moving average of the parameters.
///
/// The decay warms up as `(1 + t) / (10 + t)` so the first updates aren't dominated by
/// the initial parameters.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    params: Vec<f32>,
    decay: f32,
    updates: u64,
}

impl MovingAverage {
    pub fn new(params: &[f32], decay: f32) -> Self {
        Self {
            params: params.to_vec(),
            decay,
            updates: 0,
        }
    }

    /// Folds `params` into the average.
    pub fn update(&mut self, params: &[f32]) -> Result<()> {
        SizeMismatchErr::check(self.params.len(), params.len())?;

        let t = self.updates as f32;
        let d = self.decay.min((1. + t) / (10. + t));

        self.params
            .iter_mut()
            .zip(params)
            .for_each(|(avg, p)| *avg = d * *avg + (1. - d) * p);

        self.updates += 1;
        Ok(())
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }
}

/// The state of the model held by one client.
#[derive(Debug, Clone)]
pub struct ClientReplica {
    pub params: Vec<f32>,
    pub grad: Vec<f32>,
    average: Option<MovingAverage>,
}

impl ClientReplica {
    /// Creates a new `ClientReplica`.
    ///
    /// # Arguments
    /// * `params` - The initial global parameters.
    /// * `moving_decay` - The decay of the parameter average, `None` to not keep one.
    pub fn new(params: Vec<f32>, moving_decay: Option<f32>) -> Self {
        let average = moving_decay.map(|decay| MovingAverage::new(&params, decay));

        Self {
            grad: vec![0.; params.len()],
            params,
            average,
        }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Records that the parameters were refreshed by a synchronization.
    pub fn synchronized(&mut self) -> Result<()> {
        match &mut self.average {
            Some(average) => average.update(&self.params),
            None => Ok(()),
        }
    }

    /// The parameters to checkpoint, the average when one is kept.
    pub fn checkpoint(&self) -> &[f32] {
        match &self.average {
            Some(average) => average.params(),
            None => &self.params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grad_sum_accumulates_and_clears() {
        let mut sum = GradSum::new(2);
        sum.add(&[1., 2.], 3).unwrap();
        sum.add(&[1., 2.], 4).unwrap();

        assert_eq!(sum.sum, [2., 4.]);
        assert_eq!((sum.words, sum.steps), (7, 2));

        sum.clear();
        assert!(sum.is_empty());
        assert_eq!(sum.sum, [0., 0.]);
        assert!(sum.add(&[1.], 1).is_err());
    }

    #[test]
    fn average_warms_up() {
        let mut average = MovingAverage::new(&[0.], 0.9999);

        // The first decay is 1 / 10.
        average.update(&[10.]).unwrap();
        assert!((average.params()[0] - 9.).abs() < 1e-5);
    }

    #[test]
    fn checkpoint_prefers_the_average() {
        let mut replica = ClientReplica::new(vec![0.], Some(0.5));
        replica.params[0] = 4.;
        replica.synchronized().unwrap();

        // d = min(0.5, 1 / 10)
        assert!((replica.checkpoint()[0] - 3.6).abs() < 1e-5);
        assert_eq!(ClientReplica::new(vec![1.], None).checkpoint(), [1.]);
    }
}

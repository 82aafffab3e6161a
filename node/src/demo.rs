//! A linear least squares model trained on a synthetic dataset.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use rand::{Rng, SeedableRng, rngs::StdRng};
use worker::model::{Batch, BatchStats, Model, ModelErr, ModelStats};

/// Rows of features and their targets, row major.
#[derive(Debug, Clone, PartialEq)]
pub struct Rows {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
}

impl Batch for Rows {
    fn words(&self) -> u64 {
        self.y.len() as u64
    }

    fn size(&self) -> usize {
        self.y.len()
    }
}

/// `y = w · x + b`, trained on the mean squared error.
///
/// The parameters are the weights followed by the bias.
#[derive(Debug, Clone)]
pub struct LeastSquares {
    features: usize,
    stats: ModelStats,
}

impl LeastSquares {
    pub fn new(features: usize) -> Self {
        Self {
            features,
            stats: ModelStats::default(),
        }
    }

    /// The mean squared error of `params` over `rows`, halved.
    pub fn loss(&self, rows: &Rows, params: &[f32]) -> f32 {
        let n = rows.y.len().max(1) as f32;

        self.errors(rows, params)
            .map(|(_, err)| 0.5 * err * err)
            .sum::<f32>()
            / n
    }

    fn errors<'a>(
        &self,
        rows: &'a Rows,
        params: &'a [f32],
    ) -> impl Iterator<Item = (&'a [f32], f32)> + 'a {
        let (w, b) = params.split_at(self.features);

        rows.x.chunks_exact(self.features).zip(&rows.y).map(move |(x, y)| {
            let pred = x.iter().zip(w).map(|(x, w)| x * w).sum::<f32>() + b[0];
            (x, pred - y)
        })
    }
}

impl Model<Rows> for LeastSquares {
    fn size(&self) -> usize {
        self.features + 1
    }

    fn compute_gradients(
        &mut self,
        rows: &Rows,
        params: &[f32],
        grad: &mut [f32],
    ) -> Result<BatchStats, ModelErr> {
        if rows.x.len() != rows.y.len() * self.features {
            return Err(format!(
                "{} features for {} rows of {}",
                rows.x.len(),
                rows.y.len(),
                self.features
            )
            .into());
        }

        if params.len() != self.size() || grad.len() != self.size() {
            return Err(format!("expected {} parameters", self.size()).into());
        }

        let n = rows.y.len().max(1) as f32;
        grad.fill(0.);

        let mut loss = 0.;
        for (x, err) in self.errors(rows, params) {
            let (gw, gb) = grad.split_at_mut(self.features);
            gw.iter_mut().zip(x).for_each(|(g, x)| *g += err * x / n);
            gb[0] += err / n;
            loss += 0.5 * err * err / n;
        }

        let stats = BatchStats {
            loss,
            words: rows.words(),
        };

        self.stats.record(stats);
        Ok(stats)
    }

    fn save(&self, path: &Path, params: &[f32]) -> Result<(), ModelErr> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, params)?;
        writer.flush()?;
        Ok(())
    }

    fn load(&self, path: &Path) -> Result<Vec<f32>, ModelErr> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    fn collect_stats(&self) -> ModelStats {
        self.stats
    }
}

/// A noisy linear dataset drawn from a seeded generator.
#[derive(Debug, Clone)]
pub struct Dataset {
    features: usize,
    rows: Rows,
    truth: Vec<f32>,
}

impl Dataset {
    /// Draws `rows` rows of `features` features in `[-1, 1)`.
    pub fn synthetic(features: usize, rows: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let truth: Vec<f32> = (0..=features).map(|_| rng.random_range(-1.0..1.0)).collect();
        let x: Vec<f32> = (0..rows * features)
            .map(|_| rng.random_range(-1.0..1.0))
            .collect();

        let y = x
            .chunks_exact(features.max(1))
            .take(rows)
            .map(|row| {
                let noise: f32 = rng.random_range(-0.01..0.01);
                row.iter().zip(&truth).map(|(x, w)| x * w).sum::<f32>() + truth[features] + noise
            })
            .collect();

        Self {
            features,
            rows: Rows { x, y },
            truth,
        }
    }

    /// The weights and bias the data was drawn from.
    pub fn truth(&self) -> &[f32] {
        &self.truth
    }

    pub fn rows(&self) -> &Rows {
        &self.rows
    }

    /// Splits the dataset into batches of `batch_rows` rows, the last one possibly smaller.
    pub fn batches(&self, batch_rows: usize) -> impl Iterator<Item = Rows> + '_ {
        let batch_rows = batch_rows.max(1);

        self.rows
            .x
            .chunks(batch_rows * self.features)
            .zip(self.rows.y.chunks(batch_rows))
            .map(|(x, y)| Rows {
                x: x.to_vec(),
                y: y.to_vec(),
            })
    }
}

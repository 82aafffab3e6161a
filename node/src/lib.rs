pub mod config;
pub mod demo;
mod error;
pub mod group;
pub mod topology;
pub mod wiring;

use log::info;
use worker::model::BatchSource;

pub use config::NodeConfig;
pub use error::{NodeErr, Result};
pub use group::MultiNodeGroup;

use crate::demo::{Dataset, LeastSquares};

/// Trains the demo model on this node's share of the synthetic dataset.
///
/// Every node draws the same dataset from the configured seed and offers every batch to
/// its group, which only trains on its own.
///
/// # Returns
/// The final parameters of the first local client.
pub fn run(config: NodeConfig) -> Result<Vec<f32>> {
    let topology = config.topology()?;
    let demo = config.demo;

    let links = wiring::tcp_mesh(&config)?;
    let models = (0..topology.local_devices())
        .map(|_| LeastSquares::new(demo.features))
        .collect();

    let mut group = MultiNodeGroup::new(config.clone(), links, models)?;
    group.load()?;

    let data = Dataset::synthetic(demo.features, demo.rows, config.seed.unwrap_or_default());

    for epoch in 0..demo.epochs {
        let mut batches = data.batches(demo.batch_rows);
        while let Some(batch) = batches.next_batch() {
            group.update(batch)?;

            if demo.save_every > 0 && group.batch_iter() % demo.save_every == 0 {
                group.save(false)?;
            }
        }

        let stats = group.collect_stats()?;
        info!(
            node = topology.rank(),
            epoch = epoch,
            batches = stats.batches;
            "mean loss {:.6}",
            stats.mean_loss().unwrap_or(f64::NAN)
        );
    }

    let mut replicas = group.finish()?;
    group.save(true)?;

    let params = replicas.swap_remove(0);
    let model = LeastSquares::new(demo.features);
    info!(
        node = topology.rank();
        "final loss {:.6}",
        model.loss(data.rows(), &params)
    );

    Ok(params)
}

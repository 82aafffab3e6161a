use std::{
    env, fs,
    num::{NonZeroU64, NonZeroUsize},
    path::{Path, PathBuf},
    sync::Arc,
};

use comms::specs::{OptimizerSpec, ParamGenSpec};
use parameter_server::service::ShardSpec;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use worker::ClientConfig;

use crate::{NodeErr, Result, topology::NodeTopology};

/// The environment variable holding the path of the configuration file.
pub const CONFIG_VAR: &str = "NODE_CONFIG";
/// The environment variable overriding the configured rank.
pub const RANK_VAR: &str = "NODE_RANK";

/// One node of the topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAddr {
    pub addr: String,
    pub devices: usize,
}

/// The size of the synthetic least squares problem the binary trains.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub features: usize,
    pub rows: usize,
    pub batch_rows: usize,
    pub epochs: usize,
    /// Save a checkpoint every this many batches, `0` to only save at the end.
    pub save_every: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            features: 16,
            rows: 4096,
            batch_rows: 32,
            epochs: 4,
            save_every: 0,
        }
    }
}

/// Everything a node of the run needs to know, shared by every node but the rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub nodes: Vec<NodeAddr>,
    #[serde(default)]
    pub rank: usize,
    /// The fraction of entries left out of every push, `0` for dense synchronization.
    #[serde(default)]
    pub drop_rate: f32,
    #[serde(default)]
    pub overlap: bool,
    #[serde(default = "one")]
    pub max_compute_iters: NonZeroUsize,
    /// Commit the overlap buffer early once it holds this many words.
    #[serde(default)]
    pub commit_words: Option<NonZeroU64>,
    /// Serialize the communication threads of the node.
    #[serde(default)]
    pub single_comm: bool,
    #[serde(default = "one")]
    pub tau: NonZeroUsize,
    #[serde(default)]
    pub moving_average: bool,
    #[serde(default = "default_decay")]
    pub moving_decay: f32,
    pub optimizer: OptimizerSpec,
    #[serde(default)]
    pub local_optimizer: Option<OptimizerSpec>,
    #[serde(default)]
    pub batch_words_ref: Option<NonZeroUsize>,
    pub param_gen: ParamGenSpec,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Where checkpoints are written and loaded from.
    #[serde(default)]
    pub model: Option<PathBuf>,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub no_reload: bool,
    #[serde(default = "default_attempts")]
    pub connect_attempts: usize,
    #[serde(default)]
    pub demo: DemoConfig,
}

fn one() -> NonZeroUsize {
    NonZeroUsize::MIN
}

fn default_decay() -> f32 {
    0.9999
}

fn default_attempts() -> usize {
    50
}

impl NodeConfig {
    /// Parses and validates a configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(NodeErr::Io)?;
        Self::from_json(&json)
    }

    /// Reads the configuration named by the environment.
    ///
    /// The file is read from `NODE_CONFIG`, the rank can be overridden with `NODE_RANK`.
    pub fn from_env() -> Result<Self> {
        let path = env::var(CONFIG_VAR)
            .map_err(|e| NodeErr::Config(format!("{CONFIG_VAR} isn't usable: {e}")))?;

        let mut config = Self::load(Path::new(&path))?;

        if let Ok(rank) = env::var(RANK_VAR) {
            config.rank = rank
                .parse()
                .map_err(|e| NodeErr::Config(format!("{RANK_VAR}={rank} isn't a rank: {e}")))?;
            config.validate()?;
        }

        Ok(config)
    }

    /// Checks the options against each other.
    pub fn validate(&self) -> Result<()> {
        self.topology()?;

        if !(0. ..1.).contains(&self.drop_rate) {
            return Err(NodeErr::Config(format!(
                "drop rate {} must lie in [0, 1)",
                self.drop_rate
            )));
        }

        if self.moving_average && !(self.moving_decay > 0. && self.moving_decay < 1.) {
            return Err(NodeErr::Config(format!(
                "moving average decay {} must lie in (0, 1)",
                self.moving_decay
            )));
        }

        if self.connect_attempts == 0 {
            return Err(NodeErr::Config("at least one connect attempt is needed".into()));
        }

        Ok(())
    }

    pub fn topology(&self) -> Result<NodeTopology> {
        let devices = self.nodes.iter().map(|node| node.devices).collect();
        NodeTopology::new(devices, self.rank)
    }

    /// The options of the client with global id `client`.
    pub fn client_config(
        &self,
        client: usize,
        single_comm: Option<Arc<Mutex<()>>>,
    ) -> ClientConfig {
        ClientConfig {
            client,
            overlap: self.overlap,
            max_compute_iters: self.max_compute_iters,
            commit_words: self.commit_words,
            tau: self.tau,
            moving_decay: self.moving_average.then_some(self.moving_decay),
            local_optimizer: self.local_optimizer,
            batch_words_ref: self.batch_words_ref,
            single_comm,
        }
    }

    /// The spec of this node's shard of a global vector of `len` entries.
    pub fn shard_spec(&self, topology: &NodeTopology, len: usize) -> Result<ShardSpec> {
        let (offset, _) = topology.partition(len)?.slice_for(topology.rank());

        Ok(ShardSpec {
            node: topology.rank(),
            nodes: topology.nodes(),
            offset,
            sub_shards: topology.local_devices(),
            optimizer: self.optimizer,
            batch_words_ref: self.batch_words_ref,
            drop_rate: self.drop_rate,
        })
    }
}

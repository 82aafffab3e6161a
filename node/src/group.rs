use std::{
    mem,
    path::{Path, PathBuf},
    sync::Arc,
};

use comms::{
    msg::{Command, Msg, NodeStatus},
    tcp::TcpReader,
    transport::{self, Transport},
};
use log::{debug, info, warn};
use parameter_server::{
    initialization,
    service::{ServerBuilder, ServerHandle},
    sparse::TopK,
};
use parking_lot::Mutex;
use worker::{
    ClientHandle, ClientOutcome, ClientWorker, WorkerErr,
    model::{Batch, Model, ModelStats},
    sync::{DenseSync, ShardLinks, SparseSync, Synchronizer},
};

use crate::{
    NodeErr, Result,
    config::NodeConfig,
    topology::NodeTopology,
    wiring::{ClientLinks, NodeLinks},
};

/// The amount of commands a client can have queued.
const COMMAND_QUEUE: usize = 4;

/// The links a node holds on to until it launches.
struct PendingLinks {
    server_inbox: comms::Inbox,
    server_links: Vec<Box<dyn Transport>>,
    clients: Vec<ClientLinks>,
}

enum Stage<B, M> {
    Pending {
        params: Vec<f32>,
        models: Vec<M>,
        links: PendingLinks,
    },
    Running {
        server: ServerHandle,
        clients: Vec<ClientHandle<B, M>>,
    },
    Finished {
        outcomes: Vec<ClientOutcome<M>>,
    },
    Failed,
}

/// The training surface of one node: a server shard plus a client per local device.
///
/// Threads start with the first batch this node executes, or on `finish`.
pub struct MultiNodeGroup<B, M> {
    config: NodeConfig,
    topology: NodeTopology,
    stage: Stage<B, M>,
    status: Vec<Box<dyn Transport>>,
    _readers: Vec<TcpReader>,
    batch_iter: u64,
    next_device: usize,
}

impl<B: Batch, M: Model<B>> MultiNodeGroup<B, M> {
    /// Creates a new `MultiNodeGroup`.
    ///
    /// # Arguments
    /// * `config` - The configuration of the run.
    /// * `links` - The links of this node.
    /// * `models` - One model per local device.
    ///
    /// # Returns
    /// A `NodeErr::Config` if the models, the links and the topology disagree, or the
    /// parameters can't be split among the nodes and the local devices.
    pub fn new(config: NodeConfig, links: NodeLinks, models: Vec<M>) -> Result<Self> {
        let topology = config.topology()?;
        let devices = topology.local_devices();

        if models.len() != devices || links.clients.len() != devices {
            return Err(NodeErr::Config(format!(
                "node {} has {devices} devices but {} models and {} client links",
                topology.rank(),
                models.len(),
                links.clients.len()
            )));
        }

        if links.status.len() != topology.nodes() {
            return Err(NodeErr::Config(format!(
                "{} status links for {} nodes",
                links.status.len(),
                topology.nodes()
            )));
        }

        let len = models[0].size();
        if models.iter().any(|model| model.size() != len) {
            return Err(NodeErr::Config("the local models differ in size".into()));
        }

        let (_, shard_len) = topology.partition(len)?.slice_for(topology.rank());
        config.shard_spec(&topology, len)?.validate(shard_len)?;

        let params = initialization::generate(&config.param_gen, config.seed, len)?;

        let NodeLinks {
            server_inbox,
            server_links,
            clients,
            status,
            readers,
        } = links;

        Ok(Self {
            stage: Stage::Pending {
                params,
                models,
                links: PendingLinks {
                    server_inbox,
                    server_links,
                    clients,
                },
            },
            config,
            topology,
            status,
            _readers: readers,
            batch_iter: 0,
            next_device: 0,
        })
    }

    pub fn topology(&self) -> &NodeTopology {
        &self.topology
    }

    /// The amount of batches offered so far, executed here or not.
    pub fn batch_iter(&self) -> u64 {
        self.batch_iter
    }

    /// Replaces the initial parameters with the checkpoint at the model path, if any.
    ///
    /// # Returns
    /// Whether a checkpoint was loaded, or a `NodeErr::Config` once training started.
    pub fn load(&mut self) -> Result<bool> {
        if self.config.no_reload {
            return Ok(false);
        }

        let Some(path) = &self.config.model else {
            return Ok(false);
        };

        let Stage::Pending { params, models, .. } = &mut self.stage else {
            return Err(NodeErr::Config(
                "a checkpoint can only be loaded before training starts".into(),
            ));
        };

        if !path.exists() {
            debug!(node = self.topology.rank(); "no checkpoint at {}", path.display());
            return Ok(false);
        }

        let loaded = models[0]
            .load(path)
            .map_err(|e| NodeErr::Worker(WorkerErr::Model(e)))?;

        if loaded.len() != params.len() {
            return Err(NodeErr::Config(format!(
                "checkpoint {} holds {} parameters, the model has {}",
                path.display(),
                loaded.len(),
                params.len()
            )));
        }

        *params = loaded;
        info!(node = self.topology.rank(); "loaded checkpoint {}", path.display());
        Ok(true)
    }

    /// Offers the next batch, trained on here if it's this node's turn.
    ///
    /// Local batches are dealt to the devices round robin.
    pub fn update(&mut self, batch: B) -> Result<()> {
        let batch_iter = self.batch_iter;
        self.batch_iter += 1;

        if !self.topology.executes(batch_iter) {
            return Ok(());
        }

        self.launch()?;
        let Stage::Running { clients, .. } = &mut self.stage else {
            return Err(NodeErr::Config("the group isn't running".into()));
        };

        let device = self.next_device;
        self.next_device = (device + 1) % clients.len();

        match clients[device].step(batch) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Writes a checkpoint of the first client of the topology.
    ///
    /// Unless overwriting, an intermediate save also keeps a copy named after the batch
    /// count. Only the node hosting that client writes.
    pub fn save(&mut self, is_final: bool) -> Result<()> {
        if self.topology.rank() != 0 {
            return Ok(());
        }

        let Some(model) = self.config.model.clone() else {
            debug!("no model path, skipping save");
            return Ok(());
        };

        let mut paths = Vec::with_capacity(2);
        if !self.config.overwrite && !is_final {
            paths.push(iteration_path(&model, self.batch_iter));
        }
        paths.push(model);

        for path in paths {
            self.save_to(path)?;
        }

        Ok(())
    }

    fn save_to(&mut self, path: PathBuf) -> Result<()> {
        let res = match &mut self.stage {
            Stage::Pending { params, models, .. } => models[0]
                .save(&path, params.as_slice())
                .map_err(WorkerErr::Model),
            Stage::Running { clients, .. } => clients[0].save(path.clone()),
            Stage::Finished { outcomes } => outcomes[0]
                .model
                .save(&path, &outcomes[0].checkpoint)
                .map_err(WorkerErr::Model),
            Stage::Failed => return Err(NodeErr::Config("the group failed earlier".into())),
        };

        match res {
            Ok(()) => {
                info!(node = self.topology.rank(); "saved {}", path.display());
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// The statistics of the first local model.
    pub fn collect_stats(&mut self) -> Result<ModelStats> {
        let res = match &mut self.stage {
            Stage::Pending { models, .. } => Ok(models[0].collect_stats()),
            Stage::Running { clients, .. } => clients[0].stats(),
            Stage::Finished { outcomes } => Ok(outcomes[0].stats),
            Stage::Failed => return Err(NodeErr::Config("the group failed earlier".into())),
        };

        res.map_err(|e| self.fail(e))
    }

    /// Shuts the node down and returns the final replica of every local client.
    ///
    /// The clients flush what they didn't synchronize yet, the node tells every shard
    /// it's done, the clients pull the final parameters once every node did the same and
    /// the shard stops after serving every client of the topology.
    pub fn finish(&mut self) -> Result<Vec<Vec<f32>>> {
        self.launch()?;

        let Stage::Running {
            server,
            mut clients,
        } = mem::replace(&mut self.stage, Stage::Failed)
        else {
            return Err(NodeErr::Config("the group isn't running".into()));
        };

        let rank = self.topology.rank();

        for client in &mut clients {
            if let Err(e) = client.drain() {
                return Err(blame(server, e));
            }
        }

        let finished = Msg::Control(Command::Status {
            node: rank,
            status: NodeStatus::Finished,
        });

        transport::broadcast(&mut self.status, &finished)?;
        info!(node = rank; "finished training, waiting for the other nodes");

        let mut outcomes = Vec::with_capacity(clients.len());
        for client in clients {
            match client.finish() {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => return Err(blame(server, e)),
            }
        }

        let stats = server.join()?;
        info!(
            node = rank,
            updates = stats.updates,
            words = stats.words,
            pulls = stats.pulls;
            "server shard stopped"
        );

        let replicas = outcomes.iter().map(|outcome| outcome.params.clone()).collect();
        self.stage = Stage::Finished { outcomes };
        Ok(replicas)
    }

    /// Starts the server shard and the clients, once.
    fn launch(&mut self) -> Result<()> {
        let (params, models, links) = match mem::replace(&mut self.stage, Stage::Failed) {
            Stage::Pending {
                params,
                models,
                links,
            } => (params, models, links),
            running @ Stage::Running { .. } => {
                self.stage = running;
                return Ok(());
            }
            Stage::Finished { outcomes } => {
                self.stage = Stage::Finished { outcomes };
                return Err(NodeErr::Config("the group already finished".into()));
            }
            Stage::Failed => return Err(NodeErr::Config("the group failed earlier".into())),
        };

        let rank = self.topology.rank();
        let len = params.len();
        let partition = self.topology.partition(len)?;

        let spec = self.config.shard_spec(&self.topology, len)?;
        let shard = params[partition.range(rank)].to_vec();
        let server =
            ServerBuilder::new().build(spec, shard, links.server_links, links.server_inbox)?;

        let top_k = if self.config.drop_rate > 0. {
            let top_k = TopK::new(self.config.drop_rate);
            Some(top_k.map_err(|e| NodeErr::Config(e.to_string()))?)
        } else {
            None
        };

        let single_comm = (self.config.overlap && self.config.single_comm)
            .then(|| Arc::new(Mutex::new(())));

        let clients = self
            .topology
            .local_clients()
            .zip(models)
            .zip(links.clients)
            .map(|((client, model), links)| {
                let links = ShardLinks::new(client, partition, links.to_shards, links.inbox)?;
                let sync: Box<dyn Synchronizer> = match top_k {
                    Some(top_k) => Box::new(SparseSync::new(links, top_k)),
                    None => Box::new(DenseSync::new(links)),
                };

                let config = self.config.client_config(client, single_comm.clone());
                let worker = ClientWorker::new(config, model, params.clone(), sync)?;
                Ok(ClientHandle::spawn(worker, COMMAND_QUEUE)?)
            })
            .collect::<Result<Vec<_>>>()?;

        let training = Msg::Control(Command::Status {
            node: rank,
            status: NodeStatus::Training,
        });

        transport::broadcast(&mut self.status, &training)?;
        info!(node = rank, clients = clients.len(); "launched");

        self.stage = Stage::Running { server, clients };
        Ok(())
    }

    /// Turns a client failure into the error of the node, preferring the server's.
    fn fail(&mut self, err: WorkerErr) -> NodeErr {
        let stopped = matches!(&self.stage, Stage::Running { server, .. } if server.is_finished());
        if !stopped {
            return err.into();
        }

        match mem::replace(&mut self.stage, Stage::Failed) {
            Stage::Running { server, .. } => blame(server, err),
            _ => err.into(),
        }
    }
}

/// The server's error if it stopped with one, `err` otherwise.
fn blame(server: ServerHandle, err: WorkerErr) -> NodeErr {
    if !server.is_finished() {
        return err.into();
    }

    match server.join() {
        Err(server_err) => {
            warn!("client failed after the server shard did: {err}");
            server_err.into()
        }
        Ok(_) => err.into(),
    }
}

/// `<stem>.iter<N>.<ext>` next to `model`.
fn iteration_path(model: &Path, batch_iter: u64) -> PathBuf {
    let stem = model.file_stem().unwrap_or_default().to_string_lossy();
    let name = match model.extension() {
        Some(ext) => format!("{stem}.iter{batch_iter}.{}", ext.to_string_lossy()),
        None => format!("{stem}.iter{batch_iter}"),
    };

    model.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_intermediate_checkpoints_after_the_batch() {
        let path = iteration_path(Path::new("out/model.json"), 12);
        assert_eq!(path, Path::new("out/model.iter12.json"));

        let path = iteration_path(Path::new("model"), 3);
        assert_eq!(path, Path::new("model.iter3"));
    }
}

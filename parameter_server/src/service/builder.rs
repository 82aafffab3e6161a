use std::num::NonZeroUsize;

use comms::{Inbox, Transport, specs::OptimizerSpec};

use super::{ServerHandle, ServerShardThread};
use crate::{
    Result,
    optimization::{self, Optimizer},
    sparse::TopK,
    storage::{ParameterShard, Partition},
};

/// Everything a node needs to know to set up its shard.
#[derive(Debug, Clone)]
pub struct ShardSpec {
    /// The rank of the node, also the id of the shard.
    pub node: usize,
    pub nodes: usize,
    /// Where the shard starts in the global vector.
    pub offset: usize,
    /// The amount of sub-shards, one per local device.
    pub sub_shards: usize,
    pub optimizer: OptimizerSpec,
    pub batch_words_ref: Option<NonZeroUsize>,
    /// Zero for dense synchronization.
    pub drop_rate: f32,
}

impl ShardSpec {
    /// Checks the spec against a shard of `len` parameters without starting anything.
    ///
    /// # Returns
    /// A `ServerErr::Config` if the shard can't be split in `sub_shards` or the drop
    /// rate is invalid.
    pub fn validate(&self, len: usize) -> Result<()> {
        self.resolve(len).map(|_| ())
    }

    fn resolve(&self, len: usize) -> Result<(Partition, Option<TopK>)> {
        let partition = Partition::new(len, self.sub_shards)?;
        let top_k = match self.drop_rate {
            rate if rate > 0. => Some(TopK::new(rate)?),
            _ => None,
        };

        Ok((partition, top_k))
    }
}

/// Builds and starts server shards given a specification.
#[derive(Debug, Default)]
pub struct ServerBuilder;

impl ServerBuilder {
    /// Creates a new `ServerBuilder`.
    pub fn new() -> Self {
        Self
    }

    /// Builds a new server shard and starts it on its own thread.
    ///
    /// # Arguments
    /// * `spec` - The specification of the shard.
    /// * `params` - The initial parameters of the shard's slice.
    /// * `links` - The reply link of every client in the topology, by global client id.
    /// * `inbox` - The inbox every client and status link of the node feeds.
    ///
    /// # Returns
    /// The server handle, or a `ServerErr::Config` if the spec doesn't fit the topology.
    pub fn build(
        &self,
        spec: ShardSpec,
        params: Vec<f32>,
        links: Vec<Box<dyn Transport>>,
        inbox: Inbox,
    ) -> Result<ServerHandle> {
        self.resolve_optimizer(spec, params, links, inbox)
    }

    /// Resolves the `Optimizer` of every sub-shard.
    fn resolve_optimizer(
        &self,
        spec: ShardSpec,
        params: Vec<f32>,
        links: Vec<Box<dyn Transport>>,
        inbox: Inbox,
    ) -> Result<ServerHandle> {
        let (optimizer, reference) = (spec.optimizer, spec.batch_words_ref);
        let factory = move |len| optimization::boxed(optimizer, len, reference);
        self.terminate_build(spec, params, links, inbox, factory)
    }

    /// Builds the shard and spawns its thread.
    fn terminate_build<O, F>(
        &self,
        spec: ShardSpec,
        params: Vec<f32>,
        links: Vec<Box<dyn Transport>>,
        inbox: Inbox,
        optimizer_factory: F,
    ) -> Result<ServerHandle>
    where
        O: Optimizer + Send + 'static,
        F: FnMut(usize) -> O,
    {
        let (partition, top_k) = spec.resolve(params.len())?;

        let views = if top_k.is_some() { links.len() } else { 0 };
        let shard = ParameterShard::new(spec.offset, params, partition, views, optimizer_factory)?;

        let server = ServerShardThread::new(spec.node, spec.nodes, shard, links, top_k)?;
        Ok(server.spawn(inbox)?)
    }
}

#[cfg(test)]
mod tests {
    use comms::inbox;

    use super::*;
    use crate::ServerErr;

    fn spec(drop_rate: f32, sub_shards: usize) -> ShardSpec {
        ShardSpec {
            node: 0,
            nodes: 1,
            offset: 0,
            sub_shards,
            optimizer: OptimizerSpec::GradientDescent { learning_rate: 0.1 },
            batch_words_ref: None,
            drop_rate,
        }
    }

    #[test]
    fn rejects_invalid_topologies() {
        let build = |spec| {
            let (feed, inbox) = inbox::inbox();
            let links: Vec<Box<dyn Transport>> =
                vec![Box::new(comms::mem::MemTransport::new(0, feed))];
            ServerBuilder::new().build(spec, vec![0.; 2], links, inbox)
        };

        assert!(matches!(build(spec(0., 3)), Err(ServerErr::Config(_))));
        assert!(matches!(build(spec(1., 1)), Err(ServerErr::Config(_))));
    }

    #[test]
    fn validates_without_starting_a_thread() {
        assert!(spec(0.5, 2).validate(2).is_ok());
        assert!(matches!(spec(0., 3).validate(2), Err(ServerErr::Config(_))));
        assert!(matches!(spec(1., 1).validate(2), Err(ServerErr::Config(_))));
    }
}

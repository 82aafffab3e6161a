use std::{
    borrow::Cow,
    io,
    sync::Arc,
    thread,
};

use comms::{
    Envelope, Inbox, LinkId, Transport,
    msg::{Command, Msg, NodeStatus, Payload, PushMeta},
};
use log::{debug, info, warn};

use super::{ServerHandle, ServerState, ShardStats, state::SharedState};
use crate::{
    Result, ServerErr,
    optimization::Optimizer,
    sparse::{SparseTensor, TopK},
    storage::ParameterShard,
};

/// The thread that owns a node's parameter shard and serves every client of the topology.
///
/// Incoming links are numbered by the receiving end: links `0..clients` carry the requests
/// of the client with that global id, links `clients..clients + nodes` carry the status of
/// the node `link - clients`.
pub struct ServerShardThread<O: Optimizer> {
    node: usize,
    nodes: usize,
    shard: ParameterShard<O>,
    links: Vec<Box<dyn Transport>>,
    top_k: Option<TopK>,
    state: Arc<SharedState>,
    finished: Vec<bool>,
    requested: Vec<bool>,
    deferred: Vec<usize>,
    served: usize,
    stats: ShardStats,
    buf: Vec<f32>,
}

impl<O: Optimizer + Send + 'static> ServerShardThread<O> {
    /// Creates a new `ServerShardThread`.
    ///
    /// # Arguments
    /// * `node` - The rank of the owning node, also the shard id.
    /// * `nodes` - The amount of nodes in the topology.
    /// * `shard` - The shard to serve.
    /// * `links` - The reply link of every client in the topology, by global client id.
    /// * `top_k` - The selection rule for sparse replies, `None` in dense mode.
    ///
    /// # Returns
    /// A `ServerErr::Config` if the topology is empty or `node` is out of it.
    pub fn new(
        node: usize,
        nodes: usize,
        shard: ParameterShard<O>,
        links: Vec<Box<dyn Transport>>,
        top_k: Option<TopK>,
    ) -> Result<Self> {
        if node >= nodes {
            return Err(ServerErr::Config(format!(
                "shard {node} is out of a topology of {nodes} nodes"
            )));
        }

        if links.is_empty() {
            return Err(ServerErr::Config(format!(
                "shard {node} has no clients to serve"
            )));
        }

        let clients = links.len();
        let buf = vec![0.; shard.len()];

        Ok(Self {
            node,
            nodes,
            shard,
            links,
            top_k,
            state: Arc::new(SharedState::new(ServerState::Waiting)),
            finished: vec![false; nodes],
            requested: vec![false; clients],
            deferred: Vec::new(),
            served: 0,
            stats: ShardStats::default(),
            buf,
        })
    }

    /// Starts serving `inbox` on a dedicated thread.
    ///
    /// # Returns
    /// The handle to observe and join the thread, or an io error if it couldn't be spawned.
    pub fn spawn(self, inbox: Inbox) -> io::Result<ServerHandle> {
        let node = self.node;
        let state = Arc::clone(&self.state);

        let handle = thread::Builder::new()
            .name(format!("server-shard-{node}"))
            .spawn(move || self.run(inbox))?;

        Ok(ServerHandle::new(node, state, handle))
    }

    /// Serves messages until every client of the topology got its final parameters.
    fn run(mut self, inbox: Inbox) -> Result<ShardStats> {
        let range = self.shard.global_range();
        info!(shard = self.node; "serving parameters {range:?}");

        while self.state.load() != ServerState::Stopped {
            let Some(Envelope { link, msg }) = inbox.recv() else {
                let state = self.state.load();
                return Err(ServerErr::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("every link of shard {} closed while {state:?}", self.node),
                )));
            };

            if let Err(e) = self.handle(link, msg) {
                log::error!(shard = self.node, link = link; "{e}");
                self.state.store(ServerState::Stopped);
                return Err(e);
            }
        }

        info!(shard = self.node; "stopped after {:?}", self.stats);
        Ok(self.stats)
    }

    fn handle(&mut self, link: LinkId, msg: Msg<'static>) -> Result<()> {
        match msg {
            Msg::Data(Payload::Grad { meta, grad }) => self.on_grad(link, meta, &grad),
            Msg::Data(Payload::SparseGrad {
                meta,
                indices,
                values,
            }) => self.on_sparse_grad(link, meta, indices.into_owned(), values.into_owned()),
            Msg::Data(Payload::Pull { client }) => self.on_pull(link, client),
            Msg::Control(Command::Status { node, status }) => self.on_status(link, node, status),
            Msg::Err(detail) => Err(ServerErr::Transport(io::Error::other(format!(
                "link {link} of shard {} failed: {detail}",
                self.node
            )))),
            other => Err(self.violation(link, other.tag_name(), "not a request")),
        }
    }

    fn violation(&self, link: LinkId, tag: &'static str, detail: impl Into<String>) -> ServerErr {
        ServerErr::Protocol {
            shard: self.node,
            link,
            tag,
            detail: detail.into(),
        }
    }

    /// Checks that `link` is the client link of the client it claims to come from.
    fn client_of(&self, link: LinkId, claimed: u32, tag: &'static str) -> Result<usize> {
        let client = claimed as usize;

        if link >= self.links.len() {
            return Err(self.violation(link, tag, "client request on a node link"));
        }

        if client != link {
            let detail = format!("request for client {client} arrived on the link of client {link}");
            return Err(self.violation(link, tag, detail));
        }

        Ok(client)
    }

    /// Checks that a gradient can still be applied.
    fn accept_gradient(&self, link: LinkId, tag: &'static str) -> Result<()> {
        if self.state.load() == ServerState::Draining {
            return Err(self.violation(link, tag, "gradient after every node finished"));
        }

        Ok(())
    }

    fn on_grad(&mut self, link: LinkId, meta: PushMeta, grad: &[f32]) -> Result<()> {
        const TAG: &str = "grad_push";

        let client = self.client_of(link, meta.client, TAG)?;
        self.accept_gradient(link, TAG)?;

        if self.top_k.is_some() {
            return Err(self.violation(link, TAG, "dense gradient for a sparse shard"));
        }

        if grad.len() != self.shard.len() {
            let detail = format!(
                "gradient of {} entries for a shard of {}",
                grad.len(),
                self.shard.len()
            );

            return Err(self.violation(link, TAG, detail));
        }

        self.state.store(ServerState::Processing);
        self.shard
            .apply_gradient(grad, meta.batch_words, &mut self.buf)?;

        let reply = Msg::Data(Payload::Params(Cow::Borrowed(&self.buf)));
        self.links[client].send(&reply)?;
        self.state.store(ServerState::Waiting);

        self.stats.updates += 1;
        self.stats.words += meta.batch_words;
        debug!(shard = self.node, client = client; "applied dense gradient");
        Ok(())
    }

    fn on_sparse_grad(
        &mut self,
        link: LinkId,
        meta: PushMeta,
        indices: Vec<u32>,
        values: Vec<f32>,
    ) -> Result<()> {
        const TAG: &str = "grad_push_sparse";

        let client = self.client_of(link, meta.client, TAG)?;
        self.accept_gradient(link, TAG)?;

        let Some(top_k) = self.top_k else {
            return Err(self.violation(link, TAG, "sparse gradient for a dense shard"));
        };

        let len = self.shard.len();
        if let Err(detail) = SparseTensor::validate(&indices, &values, len) {
            return Err(self.violation(link, TAG, detail));
        }

        self.state.store(ServerState::Processing);

        let grad = SparseTensor {
            indices,
            values,
            len,
        };

        let delta = self
            .shard
            .apply_sparse(client, &grad, meta.batch_words, top_k)?;

        let reply = Msg::Data(Payload::SparseDelta {
            indices: Cow::Owned(delta.indices),
            values: Cow::Owned(delta.values),
        });

        self.links[client].send(&reply)?;
        self.state.store(ServerState::Waiting);

        self.stats.updates += 1;
        self.stats.words += meta.batch_words;
        debug!(shard = self.node, client = client; "applied sparse gradient");
        Ok(())
    }

    fn on_status(&mut self, link: LinkId, node: usize, status: NodeStatus) -> Result<()> {
        const TAG: &str = "control/status";

        let clients = self.links.len();
        if link < clients || link - clients != node || node >= self.nodes {
            let detail = format!("status of node {node} on an unexpected link");
            return Err(self.violation(link, TAG, detail));
        }

        match status {
            NodeStatus::Training => {
                debug!(shard = self.node, node = node; "node is training");
                Ok(())
            }
            NodeStatus::Finished if self.finished[node] => {
                Err(self.violation(link, TAG, format!("node {node} finished twice")))
            }
            NodeStatus::Finished => {
                self.finished[node] = true;

                let done = self.finished.iter().filter(|&&f| f).count();
                info!(shard = self.node, node = node; "node finished, {done}/{} done", self.nodes);

                if done == self.nodes {
                    self.drain()?;
                }

                Ok(())
            }
        }
    }

    fn on_pull(&mut self, link: LinkId, client: u32) -> Result<()> {
        const TAG: &str = "param_pull";

        let client = self.client_of(link, client, TAG)?;
        if self.requested[client] {
            return Err(self.violation(link, TAG, format!("client {client} pulled twice")));
        }

        self.requested[client] = true;

        if self.state.load() == ServerState::Draining {
            self.serve_pull(client)
        } else {
            debug!(shard = self.node, client = client; "deferring final pull");
            self.deferred.push(client);
            Ok(())
        }
    }

    /// Enters the draining state and answers the pulls that arrived early.
    fn drain(&mut self) -> Result<()> {
        self.state.store(ServerState::Draining);
        info!(shard = self.node; "every node finished, draining");

        for client in std::mem::take(&mut self.deferred) {
            self.serve_pull(client)?;
        }

        self.stop_if_served();
        Ok(())
    }

    fn serve_pull(&mut self, client: usize) -> Result<()> {
        self.shard.pull_params(&mut self.buf)?;

        let reply = Msg::Data(Payload::Params(Cow::Borrowed(&self.buf)));
        if let Err(e) = self.links[client].send(&reply) {
            warn!(shard = self.node, client = client; "final pull reply failed: {e}");
            return Err(e.into());
        }

        self.served += 1;
        self.stats.pulls += 1;
        self.stop_if_served();
        Ok(())
    }

    fn stop_if_served(&mut self) {
        if self.served == self.links.len() {
            self.state.store(ServerState::Stopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use comms::{inbox, mem::MemTransport};

    use super::*;
    use crate::{optimization::GradientDescent, storage::Partition};

    struct Fixture {
        handle: ServerHandle,
        to_server: Vec<MemTransport>,
        status: Vec<MemTransport>,
        replies: Vec<Inbox>,
    }

    /// A shard of 4 parameters at 1.0 serving `clients` clients of a 2 node topology.
    fn spawn_shard(clients: usize) -> Fixture {
        const NODES: usize = 2;

        let partition = Partition::new(4, 1).unwrap();
        let shard =
            ParameterShard::new(0, vec![1.; 4], partition, 0, |_| GradientDescent::new(0.5))
                .unwrap();

        let (feed, server_inbox) = inbox::inbox();
        let mut links: Vec<Box<dyn Transport>> = Vec::new();
        let mut replies = Vec::new();
        let mut to_server = Vec::new();

        for client in 0..clients {
            let (reply_feed, reply_inbox) = inbox::inbox();
            links.push(Box::new(MemTransport::new(0, reply_feed)));
            replies.push(reply_inbox);
            to_server.push(MemTransport::new(client, feed.clone()));
        }

        let status = (0..NODES)
            .map(|node| MemTransport::new(clients + node, feed.clone()))
            .collect();

        let server = ServerShardThread::new(0, NODES, shard, links, None).unwrap();
        let handle = server.spawn(server_inbox).unwrap();

        Fixture {
            handle,
            to_server,
            status,
            replies,
        }
    }

    fn finished(node: usize) -> Msg<'static> {
        Msg::Control(Command::Status {
            node,
            status: NodeStatus::Finished,
        })
    }

    fn grad(client: u32, values: Vec<f32>) -> Msg<'static> {
        Msg::Data(Payload::Grad {
            meta: PushMeta {
                client,
                batch_words: 0,
            },
            grad: Cow::Owned(values),
        })
    }

    #[test]
    fn dense_round_trip_matches_the_optimizer() {
        let mut fx = spawn_shard(1);

        fx.to_server[0].send(&grad(0, vec![1., 0., -1., 2.])).unwrap();
        let reply = fx.replies[0].recv().unwrap();

        let mut expected = [1.; 4];
        GradientDescent::new(0.5)
            .update_params(&[1., 0., -1., 2.], &mut expected, 0)
            .unwrap();

        assert_eq!(
            reply.msg,
            Msg::Data(Payload::Params(Cow::Owned(expected.to_vec())))
        );

        fx.to_server[0]
            .send(&Msg::Data(Payload::Pull { client: 0 }))
            .unwrap();
        fx.status[1].send(&finished(1)).unwrap();
        fx.status[0].send(&finished(0)).unwrap();

        let reply = fx.replies[0].recv().unwrap();
        assert_eq!(
            reply.msg,
            Msg::Data(Payload::Params(Cow::Owned(expected.to_vec())))
        );

        let stats = fx.handle.join().unwrap();
        assert_eq!(stats.updates, 1);
        assert_eq!(stats.pulls, 1);
    }

    #[test]
    fn stops_once_finished_and_pulled() {
        let mut fx = spawn_shard(2);

        fx.status[0].send(&finished(0)).unwrap();
        fx.status[1].send(&finished(1)).unwrap();

        for (client, link) in fx.to_server.iter_mut().enumerate() {
            link.send(&Msg::Data(Payload::Pull {
                client: client as u32,
            }))
            .unwrap();
        }

        for replies in &fx.replies {
            assert!(matches!(
                replies.recv().unwrap().msg,
                Msg::Data(Payload::Params(_))
            ));
        }

        let stats = fx.handle.join().unwrap();
        assert_eq!(stats.pulls, 2);
    }

    #[test]
    fn wrong_length_is_a_protocol_violation() {
        let mut fx = spawn_shard(1);

        fx.to_server[0].send(&grad(0, vec![1.; 3])).unwrap();

        let err = fx.handle.join().unwrap_err();
        assert!(matches!(
            err,
            ServerErr::Protocol {
                shard: 0,
                link: 0,
                tag: "grad_push",
                ..
            }
        ));
    }

    #[test]
    fn duplicate_finish_is_a_protocol_violation() {
        let mut fx = spawn_shard(1);

        fx.status[1].send(&finished(1)).unwrap();
        fx.status[1].send(&finished(1)).unwrap();

        assert!(matches!(
            fx.handle.join(),
            Err(ServerErr::Protocol { link: 2, .. })
        ));
    }

    #[test]
    fn gradient_after_finish_is_rejected() {
        let mut fx = spawn_shard(1);

        fx.status[0].send(&finished(0)).unwrap();
        fx.status[1].send(&finished(1)).unwrap();
        fx.to_server[0].send(&grad(0, vec![0.; 4])).unwrap();

        assert!(matches!(
            fx.handle.join(),
            Err(ServerErr::Protocol {
                tag: "grad_push",
                ..
            })
        ));
    }

    #[test]
    fn spoofed_client_is_rejected() {
        let mut fx = spawn_shard(2);

        fx.to_server[1].send(&grad(0, vec![0.; 4])).unwrap();
        assert!(matches!(
            fx.handle.join(),
            Err(ServerErr::Protocol { link: 1, .. })
        ));
    }
}

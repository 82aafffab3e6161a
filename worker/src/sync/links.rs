use comms::{
    Envelope, Inbox, Transport,
    msg::{Msg, Payload},
};
use parameter_server::storage::Partition;

use crate::{Result, WorkerErr};

/// The links of one client to every shard, plus the inbox the shards reply into.
///
/// Replies are tagged with the id of the shard that sent them.
pub struct ShardLinks {
    client: usize,
    partition: Partition,
    links: Vec<Box<dyn Transport>>,
    inbox: Inbox,
}

impl ShardLinks {
    /// Creates a new `ShardLinks`.
    ///
    /// # Arguments
    /// * `client` - The global id of the client.
    /// * `partition` - The split of the global vector into shards.
    /// * `links` - One link per shard, in shard order.
    /// * `inbox` - The inbox the shards reply into.
    ///
    /// # Returns
    /// A `WorkerErr::Config` if there isn't exactly one link per shard.
    pub fn new(
        client: usize,
        partition: Partition,
        links: Vec<Box<dyn Transport>>,
        inbox: Inbox,
    ) -> Result<Self> {
        if links.len() != partition.parts() {
            return Err(WorkerErr::Config(format!(
                "client {client} has {} links for {} shards",
                links.len(),
                partition.parts()
            )));
        }

        Ok(Self {
            client,
            partition,
            links,
            inbox,
        })
    }

    pub fn client(&self) -> usize {
        self.client
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn shards(&self) -> usize {
        self.links.len()
    }

    pub fn send(&mut self, shard: usize, msg: &Msg<'_>) -> Result<()> {
        Ok(self.links[shard].send(msg)?)
    }

    /// Blocks until a reply arrives from any shard.
    pub fn recv_any(&self) -> Result<Envelope> {
        let Some(envelope) = self.inbox.recv() else {
            return Err(WorkerErr::Disconnected(format!(
                "every shard link of client {} closed",
                self.client
            )));
        };

        if let Msg::Err(detail) = &envelope.msg {
            return Err(WorkerErr::Transport(std::io::Error::other(format!(
                "link to shard {} failed: {detail}",
                envelope.link
            ))));
        }

        Ok(envelope)
    }

    /// Blocks until the reply of `shard` arrives.
    ///
    /// A client only ever has one request in flight outside of the final pull, so a
    /// reply from any other shard breaks the protocol.
    pub fn recv_from(&self, shard: usize) -> Result<Msg<'static>> {
        let Envelope { link, msg } = self.recv_any()?;

        if link != shard {
            return Err(self.violation(
                link,
                msg.tag_name(),
                format!("reply from shard {link} while waiting on shard {shard}"),
            ));
        }

        Ok(msg)
    }

    pub fn violation(
        &self,
        shard: usize,
        tag: &'static str,
        detail: impl Into<String>,
    ) -> WorkerErr {
        WorkerErr::Protocol {
            client: self.client,
            shard,
            tag,
            detail: detail.into(),
        }
    }

    /// Requests the final parameters of every shard and writes them into `params`.
    ///
    /// All requests are sent before waiting, the shards only answer once every node
    /// finished, in whatever order they drain.
    pub fn pull(&mut self, params: &mut [f32]) -> Result<()> {
        let mut slices = self.partition.split_mut(params)?;
        let client = self.client as u32;

        for shard in 0..self.links.len() {
            self.send(shard, &Msg::Data(Payload::Pull { client }))?;
        }

        let mut pending = vec![true; self.links.len()];
        for _ in 0..self.links.len() {
            let Envelope { link, msg } = self.recv_any()?;

            if !pending.get(link).copied().unwrap_or(false) {
                return Err(self.violation(link, msg.tag_name(), "unexpected final pull reply"));
            }

            pending[link] = false;
            copy_params(self, link, msg, &mut *slices[link])?;
        }

        Ok(())
    }
}

/// Writes a dense `PARAM_PUSH` reply of `shard` into `out`.
pub(super) fn copy_params(
    links: &ShardLinks,
    shard: usize,
    msg: Msg<'_>,
    out: &mut [f32],
) -> Result<()> {
    match msg {
        Msg::Data(Payload::Params(params)) if params.len() == out.len() => {
            out.copy_from_slice(&params);
            Ok(())
        }
        Msg::Data(Payload::Params(params)) => Err(links.violation(
            shard,
            "param_push",
            format!("{} parameters for a shard of {}", params.len(), out.len()),
        )),
        other => Err(links.violation(shard, other.tag_name(), "expected dense parameters")),
    }
}

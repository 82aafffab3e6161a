use std::borrow::Cow;

use comms::msg::{Msg, Payload, PushMeta};
use log::debug;
use parking_lot::Mutex;
use parameter_server::storage::SizeMismatchErr;

use super::{ShardLinks, Synchronizer, links::copy_params};
use crate::Result;

/// Exchanges full gradient slices for full parameter slices, shard by shard.
pub struct DenseSync {
    links: ShardLinks,
}

impl DenseSync {
    pub fn new(links: ShardLinks) -> Self {
        Self { links }
    }
}

impl Synchronizer for DenseSync {
    fn synchronize(
        &mut self,
        grad: &[f32],
        params: &mut [f32],
        batch_words: u64,
        channel: Option<&Mutex<()>>,
    ) -> Result<()> {
        let partition = *self.links.partition();
        SizeMismatchErr::check(partition.len(), grad.len())?;
        let mut slices = partition.split_mut(params)?;

        let _guard = channel.map(|lock| lock.lock());
        let meta = PushMeta {
            client: self.links.client() as u32,
            batch_words,
        };

        for shard in 0..self.links.shards() {
            let msg = Msg::Data(Payload::Grad {
                meta,
                grad: Cow::Borrowed(&grad[partition.range(shard)]),
            });

            self.links.send(shard, &msg)?;
            let reply = self.links.recv_from(shard)?;
            copy_params(&self.links, shard, reply, &mut *slices[shard])?;
        }

        debug!(client = self.links.client(); "dense synchronization done");
        Ok(())
    }

    fn pull(&mut self, params: &mut [f32]) -> Result<()> {
        self.links.pull(params)
    }
}

use std::borrow::Cow;

use comms::msg::{Msg, Payload, PushMeta};
use log::debug;
use parking_lot::Mutex;
use parameter_server::sparse::{SparseCodec, SparseTensor, TopK};

use super::{ShardLinks, Synchronizer};
use crate::Result;

/// Exchanges the top-k of the gradient for the top-k of the parameter delta.
///
/// Both directions keep what they leave out: the client in its per shard residuals,
/// the shard in its view of the client's parameters.
pub struct SparseSync {
    links: ShardLinks,
    codec: SparseCodec,
}

impl SparseSync {
    pub fn new(links: ShardLinks, top_k: TopK) -> Self {
        let codec = SparseCodec::new(*links.partition(), top_k);
        Self { links, codec }
    }
}

impl Synchronizer for SparseSync {
    fn synchronize(
        &mut self,
        grad: &[f32],
        params: &mut [f32],
        batch_words: u64,
        channel: Option<&Mutex<()>>,
    ) -> Result<()> {
        let _guard = channel.map(|lock| lock.lock());
        let meta = PushMeta {
            client: self.links.client() as u32,
            batch_words,
        };

        for shard in 0..self.links.shards() {
            let sparse = self.codec.encode(shard, grad)?;
            let msg = Msg::Data(Payload::SparseGrad {
                meta,
                indices: Cow::Borrowed(&sparse.indices),
                values: Cow::Borrowed(&sparse.values),
            });

            self.links.send(shard, &msg)?;

            let (indices, values) = match self.links.recv_from(shard)? {
                Msg::Data(Payload::SparseDelta { indices, values }) => (indices, values),
                other => {
                    let tag = other.tag_name();
                    return Err(self.links.violation(shard, tag, "expected a sparse delta"));
                }
            };

            let len = self.links.partition().slice_for(shard).1;
            if let Err(detail) = SparseTensor::validate(&indices, &values, len) {
                return Err(self.links.violation(shard, "param_push_sparse", detail));
            }

            let delta = SparseTensor {
                indices: indices.into_owned(),
                values: values.into_owned(),
                len,
            };

            self.codec.decode(shard, &delta, params)?;
        }

        debug!(client = self.links.client(); "sparse synchronization done");
        Ok(())
    }

    fn pull(&mut self, params: &mut [f32]) -> Result<()> {
        self.links.pull(params)
    }
}

use super::{SparseTensor, TopK};
use crate::storage::{Partition, Result, SizeMismatchErr};

/// Keeps the undelivered part of a gradient slice between rounds.
///
/// Every round adds the new gradient into the residual and hands out its top-k entries,
/// zeroing them. Whatever wasn't selected stays in the residual and keeps growing until
/// it is large enough to be picked.
#[derive(Debug)]
pub struct GradientDropper {
    residual: Box<[f32]>,
    top_k: TopK,
}

impl GradientDropper {
    /// Creates a new `GradientDropper` for a slice of `len` entries.
    pub fn new(len: usize, top_k: TopK) -> Self {
        Self {
            residual: vec![0.; len].into_boxed_slice(),
            top_k,
        }
    }

    /// Accumulates `grad` and takes out the entries to send this round.
    ///
    /// # Returns
    /// The selected entries, or a `SizeMismatchErr` if `grad` doesn't match the residual.
    pub fn encode(&mut self, grad: &[f32]) -> Result<SparseTensor> {
        SizeMismatchErr::check(self.residual.len(), grad.len())?;

        self.residual
            .iter_mut()
            .zip(grad)
            .for_each(|(r, g)| *r += g);

        let indices = self.top_k.select(&self.residual);
        let values = indices
            .iter()
            .map(|&i| std::mem::take(&mut self.residual[i as usize]))
            .collect();

        Ok(SparseTensor {
            indices,
            values,
            len: self.residual.len(),
        })
    }

    /// The values that haven't been delivered yet.
    pub fn residual(&self) -> &[f32] {
        &self.residual
    }
}

/// The client side of sparse synchronization, one dropper per shard.
#[derive(Debug)]
pub struct SparseCodec {
    partition: Partition,
    droppers: Vec<GradientDropper>,
}

impl SparseCodec {
    /// Creates a new `SparseCodec`.
    ///
    /// # Arguments
    /// * `partition` - The split of the global vector into shards.
    /// * `top_k` - The selection rule for gradients.
    pub fn new(partition: Partition, top_k: TopK) -> Self {
        let droppers = (0..partition.parts())
            .map(|shard| GradientDropper::new(partition.slice_for(shard).1, top_k))
            .collect();

        Self {
            partition,
            droppers,
        }
    }

    /// Encodes the gradient slice meant for `shard`.
    ///
    /// # Arguments
    /// * `shard` - The id of the destination shard.
    /// * `grad` - The full gradient of the client.
    ///
    /// # Returns
    /// The entries of `shard`'s slice to send, with indices relative to the slice.
    pub fn encode(&mut self, shard: usize, grad: &[f32]) -> Result<SparseTensor> {
        SizeMismatchErr::check(self.partition.len(), grad.len())?;
        self.droppers[shard].encode(&grad[self.partition.range(shard)])
    }

    /// Applies the delta returned by `shard` onto the client's parameters.
    ///
    /// # Arguments
    /// * `shard` - The id of the shard that sent the delta.
    /// * `delta` - The delta, with indices relative to the shard slice.
    /// * `params` - The full parameters of the client.
    pub fn decode(&self, shard: usize, delta: &SparseTensor, params: &mut [f32]) -> Result<()> {
        SizeMismatchErr::check(self.partition.len(), params.len())?;
        delta.add_to(&mut params[self.partition.range(shard)])
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_coordinate_is_eventually_sent() {
        const LEN: usize = 10;

        let mut dropper = GradientDropper::new(LEN, TopK::new(0.5).unwrap());
        let grad: Vec<f32> = (1..=LEN).map(|i| i as f32).collect();
        let mut sent = [false; LEN];

        for _ in 0..LEN {
            let sparse = dropper.encode(&grad).unwrap();
            assert_eq!(sparse.indices.len(), 5);

            for &i in &sparse.indices {
                sent[i as usize] = true;
            }
        }

        assert!(sent.iter().all(|&s| s), "starved coordinates: {sent:?}");
    }

    #[test]
    fn a_drop_rate_close_to_one_still_sends() {
        const LEN: usize = 10;

        let mut dropper = GradientDropper::new(LEN, TopK::new(0.999999).unwrap());
        let mut sent = [false; LEN];

        for _ in 0..LEN {
            let sparse = dropper.encode(&[1.; LEN]).unwrap();
            assert_eq!(sparse.indices.len(), 1);
            sent[sparse.indices[0] as usize] = true;
        }

        assert!(sent.iter().all(|&s| s), "starved coordinates: {sent:?}");
        assert!(dropper.residual().iter().all(|&r| r < LEN as f32));
    }

    #[test]
    fn nothing_is_lost() {
        let mut dropper = GradientDropper::new(4, TopK::new(0.5).unwrap());
        let grad = [0.25, -3., 1., 0.5];

        let mut delivered = [0.; 4];
        for _ in 0..3 {
            dropper.encode(&grad).unwrap().add_to(&mut delivered).unwrap();
        }

        for i in 0..4 {
            assert_eq!(delivered[i] + dropper.residual()[i], grad[i] * 3.);
        }
    }

    #[test]
    fn codec_works_on_shard_slices() {
        let partition = Partition::new(5, 2).unwrap();
        let mut codec = SparseCodec::new(partition, TopK::new(0.5).unwrap());

        let grad = [0., 0., 0., 4., -1.];
        let sparse = codec.encode(1, &grad).unwrap();
        assert_eq!(sparse.indices, [0]);
        assert_eq!(sparse.values, [4.]);

        let mut params = [0.; 5];
        codec.decode(1, &sparse, &mut params).unwrap();
        assert_eq!(params, [0., 0., 0., 4., 0.]);
    }
}

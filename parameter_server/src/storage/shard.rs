use std::ops::Range;

use parking_lot::Mutex;
use rayon::prelude::*;

use super::{Partition, Result, SizeMismatchErr};
use crate::{
    optimization::Optimizer,
    sparse::{SparseTensor, TopK},
};

/// The slice of a node's shard updated by one device worth of compute.
#[derive(Debug)]
struct SubShard<O: Optimizer> {
    params: Box<[f32]>,
    grad: Box<[f32]>,
    optimizer: O,
    views: Vec<Box<[f32]>>,
}

impl<O: Optimizer> SubShard<O> {
    fn apply_gradient(&mut self, grad: &[f32], batch_words: u64, out: &mut [f32]) -> Result<()> {
        self.optimizer
            .update_params(grad, &mut self.params, batch_words)?;

        out.copy_from_slice(&self.params);
        Ok(())
    }

    /// Scatters `values` into the gradient scratch, updates and returns the top-k of the
    /// parameter delta against `client`'s view, relative to this sub-shard.
    fn apply_sparse(
        &mut self,
        client: usize,
        indices: &[u32],
        values: &[f32],
        offset: u32,
        batch_words: u64,
        top_k: TopK,
    ) -> Result<(Vec<u32>, Vec<f32>)> {
        let Self {
            params,
            grad,
            optimizer,
            views,
        } = self;

        let nviews = views.len();
        let view = views
            .get_mut(client)
            .ok_or(SizeMismatchErr { expected: nviews, got: client + 1 })?;

        grad.fill(0.);
        for (&i, &v) in indices.iter().zip(values) {
            let slot = i
                .checked_sub(offset)
                .map(|i| i as usize)
                .filter(|&i| i < grad.len())
                .ok_or(SizeMismatchErr {
                    expected: offset as usize + grad.len(),
                    got: i as usize + 1,
                })?;

            grad[slot] = v;
        }

        optimizer.update_params(grad, params, batch_words)?;

        // The scratch is reused to hold the delta against the client's view.
        grad.iter_mut()
            .zip(params.iter())
            .zip(view.iter())
            .for_each(|((d, p), v)| *d = p - v);

        let selected = top_k.select(grad);
        let deltas: Vec<f32> = selected
            .iter()
            .map(|&i| {
                let delta = grad[i as usize];
                view[i as usize] += delta;
                delta
            })
            .collect();

        let selected = selected.into_iter().map(|i| i + offset).collect();
        Ok((selected, deltas))
    }
}

/// The slice of the global parameter vector owned by one node.
///
/// It's split into one sub-shard per local device, each behind its own lock and holding
/// its own optimizer state, so updates to different sub-shards run in parallel while two
/// updates of the same sub-shard are always applied one after the other.
#[derive(Debug)]
pub struct ParameterShard<O: Optimizer> {
    offset: usize,
    partition: Partition,
    subs: Box<[Mutex<SubShard<O>>]>,
}

impl<O: Optimizer + Send> ParameterShard<O> {
    /// Creates a new `ParameterShard`.
    ///
    /// # Arguments
    /// * `offset` - Where this shard starts in the global vector.
    /// * `params` - The initial state of the shard's parameters.
    /// * `partition` - The split of the shard into sub-shards.
    /// * `views` - The amount of clients to keep a parameter view for, zero unless sparse.
    /// * `optimizer_factory` - An `Optimizer` factory closure, called once per sub-shard.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `params` doesn't match `partition`.
    pub fn new<F>(
        offset: usize,
        params: Vec<f32>,
        partition: Partition,
        views: usize,
        mut optimizer_factory: F,
    ) -> Result<Self>
    where
        F: FnMut(usize) -> O,
    {
        let subs = partition
            .split(&params)?
            .into_iter()
            .map(|slice| {
                let sub = SubShard {
                    params: slice.into(),
                    grad: vec![0.; slice.len()].into_boxed_slice(),
                    optimizer: optimizer_factory(slice.len()),
                    views: vec![Box::from(slice); views],
                };

                Mutex::new(sub)
            })
            .collect();

        Ok(Self {
            offset,
            partition,
            subs,
        })
    }

    /// The amount of parameters in this shard.
    pub fn len(&self) -> usize {
        self.partition.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The range of the global vector held by this shard.
    pub fn global_range(&self) -> Range<usize> {
        self.offset..self.offset + self.len()
    }

    /// Applies `grad` through every sub-shard's optimizer and copies the result into `out`.
    ///
    /// # Arguments
    /// * `grad` - The gradient for this shard's slice.
    /// * `batch_words` - The amount of words behind `grad`.
    /// * `out` - Where the updated parameters are copied.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `grad` or `out` don't match the shard size.
    pub fn apply_gradient(&self, grad: &[f32], batch_words: u64, out: &mut [f32]) -> Result<()> {
        let grads = self.partition.split(grad)?;
        let outs = self.partition.split_mut(out)?;

        self.subs
            .par_iter()
            .zip(grads)
            .zip(outs)
            .try_for_each(|((sub, grad), out)| sub.lock().apply_gradient(grad, batch_words, out))
    }

    /// Applies a sparse gradient and returns the part of the parameter delta `client` gets.
    ///
    /// The delta of each sub-shard is taken against the parameters `client` was last
    /// given, and whatever is returned is folded into that view, so the entries left out
    /// keep growing until they're selected.
    ///
    /// # Arguments
    /// * `client` - The global id of the client.
    /// * `grad` - The gradient entries, indices relative to this shard and ascending.
    /// * `batch_words` - The amount of words behind `grad`.
    /// * `top_k` - The selection rule for the returned delta.
    ///
    /// # Returns
    /// The delta with indices relative to this shard, or a `SizeMismatchErr` if `grad`
    /// doesn't fit the shard or `client` has no view.
    pub fn apply_sparse(
        &self,
        client: usize,
        grad: &SparseTensor,
        batch_words: u64,
        top_k: TopK,
    ) -> Result<SparseTensor> {
        SizeMismatchErr::check(self.len(), grad.len)?;

        let mut bounds = Vec::with_capacity(self.partition.parts() + 1);
        bounds.push(0);
        for part in 0..self.partition.parts() {
            let end = self.partition.range(part).end as u32;
            bounds.push(grad.indices.partition_point(|&i| i < end));
        }

        let deltas = self
            .subs
            .par_iter()
            .enumerate()
            .map(|(part, sub)| {
                let entries = bounds[part]..bounds[part + 1];
                let offset = self.partition.range(part).start as u32;

                sub.lock().apply_sparse(
                    client,
                    &grad.indices[entries.clone()],
                    &grad.values[entries],
                    offset,
                    batch_words,
                    top_k,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mut delta = SparseTensor::empty(self.len());
        for (indices, values) in deltas {
            delta.indices.extend(indices);
            delta.values.extend(values);
        }

        Ok(delta)
    }

    /// Copies the shard's inner parameters into the provided destination buffer.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if `out` isn't the same size as this shard.
    pub fn pull_params(&self, out: &mut [f32]) -> Result<()> {
        let outs = self.partition.split_mut(out)?;

        self.subs
            .par_iter()
            .zip(outs)
            .for_each(|(sub, out)| out.copy_from_slice(&sub.lock().params));

        Ok(())
    }
}

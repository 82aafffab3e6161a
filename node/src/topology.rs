use std::ops::Range;

use parameter_server::storage::Partition;

use crate::{NodeErr, Result};

/// The fixed set of nodes and devices of a run, seen from one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTopology {
    devices: Vec<usize>,
    rank: usize,
}

impl NodeTopology {
    /// Creates a new `NodeTopology`.
    ///
    /// # Arguments
    /// * `devices` - The amount of devices of every node, by rank.
    /// * `rank` - The rank of this node.
    ///
    /// # Returns
    /// A `NodeErr::Config` if there are no nodes, a node has no devices or `rank` is out of
    /// the topology.
    pub fn new(devices: Vec<usize>, rank: usize) -> Result<Self> {
        if devices.is_empty() {
            return Err(NodeErr::Config("the topology has no nodes".into()));
        }

        if let Some(node) = devices.iter().position(|&count| count == 0) {
            return Err(NodeErr::Config(format!("node {node} has no devices")));
        }

        if rank >= devices.len() {
            return Err(NodeErr::Config(format!(
                "rank {rank} is out of a topology of {} nodes",
                devices.len()
            )));
        }

        Ok(Self { devices, rank })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn nodes(&self) -> usize {
        self.devices.len()
    }

    /// The amount of devices of `node`.
    pub fn devices(&self, node: usize) -> usize {
        self.devices[node]
    }

    pub fn local_devices(&self) -> usize {
        self.devices[self.rank]
    }

    /// The amount of clients across every node.
    pub fn clients(&self) -> usize {
        self.devices.iter().sum()
    }

    /// The global ids of the clients of `node`.
    pub fn clients_of(&self, node: usize) -> Range<usize> {
        let start = self.devices[..node].iter().sum();
        start..start + self.devices[node]
    }

    pub fn local_clients(&self) -> Range<usize> {
        self.clients_of(self.rank)
    }

    /// The node hosting the client with global id `client`.
    pub fn node_of(&self, client: usize) -> Option<usize> {
        (0..self.nodes()).find(|&node| self.clients_of(node).contains(&client))
    }

    /// The link id the server inbox knows the status link of `node` by.
    pub fn status_link(&self, node: usize) -> usize {
        self.clients() + node
    }

    /// Whether this node trains on the batch at `batch_iter`.
    pub fn executes(&self, batch_iter: u64) -> bool {
        batch_iter % self.nodes() as u64 == self.rank as u64
    }

    /// The split of a global vector of `len` entries into one shard per node.
    pub fn partition(&self, len: usize) -> Result<Partition> {
        Partition::new(len, self.nodes())
            .map_err(|e| NodeErr::Config(format!("can't shard the parameters: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_clients_by_rank() {
        let topology = NodeTopology::new(vec![2, 1, 3], 2).unwrap();

        assert_eq!(topology.clients(), 6);
        assert_eq!(topology.clients_of(1), 2..3);
        assert_eq!(topology.local_clients(), 3..6);
        assert_eq!(topology.node_of(4), Some(2));
        assert_eq!(topology.node_of(6), None);
        assert_eq!(topology.status_link(1), 7);
    }

    #[test]
    fn batches_are_dealt_round_robin() {
        let topology = NodeTopology::new(vec![1, 1], 1).unwrap();
        let executed: Vec<_> = (0..6).filter(|&i| topology.executes(i)).collect();

        assert_eq!(executed, [1, 3, 5]);
    }

    #[test]
    fn rejects_broken_topologies() {
        assert!(NodeTopology::new(vec![], 0).is_err());
        assert!(NodeTopology::new(vec![1, 0], 0).is_err());
        assert!(NodeTopology::new(vec![1, 1], 2).is_err());
    }
}

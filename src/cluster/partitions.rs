//! Partition map: hashed key -> partition id -> owning node
//!
//! The hash space is carved into `q` equal ranges; a partition id is the
//! lower bound of its range and never changes, only its owner does.
//! Rebalancing keeps ownership as even as possible while moving the fewest
//! partitions, and is deterministic given the sorted node set.

use crate::common::hash::HASH_SPACE;
use crate::common::{Error, NodeId, PartitionId, Result};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Ordered `(owner, partition)` assignment of length `q`, plus an owner
/// index for O(1) lookup. Entries are kept in partition-id order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionMap {
    entries: Vec<(NodeId, PartitionId)>,
    index: HashMap<PartitionId, NodeId>,
}

/// Width of each partition's hash range for a given partition count.
fn range_width(q: u64) -> u64 {
    HASH_SPACE.div_ceil(q)
}

/// Lower bound of the hash range containing `hash`. Total on the hash
/// space; no special case at range boundaries.
pub fn partition_for_hash(hash: u64, q: u64) -> PartitionId {
    let range = range_width(q);
    ((hash % HASH_SPACE) / range) * range
}

/// Walk `nodes` starting at `start`, wrapping around, taking `n` distinct
/// entries. With `n >= |nodes|` every node is a replica.
pub fn replicas(start: &NodeId, n: usize, nodes: &[NodeId]) -> Result<Vec<NodeId>> {
    let i = nodes
        .iter()
        .position(|m| m == start)
        .ok_or_else(|| Error::UnknownNode(start.clone()))?;
    let take = n.min(nodes.len());
    Ok(nodes[i..]
        .iter()
        .chain(nodes[..i].iter())
        .take(take)
        .cloned()
        .collect())
}

/// Same walk over the reversed ring: the nodes for which `start` is one of
/// their `n` forward replicas.
pub fn reverse_replicas(start: &NodeId, n: usize, nodes: &[NodeId]) -> Result<Vec<NodeId>> {
    let reversed: Vec<NodeId> = nodes.iter().rev().cloned().collect();
    replicas(start, n, &reversed)
}

fn sorted_unique(nodes: &[NodeId]) -> Vec<NodeId> {
    let mut nodes = nodes.to_vec();
    nodes.sort();
    nodes.dedup();
    nodes
}

impl PartitionMap {
    /// Build a map from explicit entries, validating that every partition
    /// id appears exactly once.
    pub fn from_entries(entries: Vec<(NodeId, PartitionId)>) -> Result<Self> {
        let mut index = HashMap::with_capacity(entries.len());
        for (owner, partition) in &entries {
            if index.insert(*partition, owner.clone()).is_some() {
                return Err(Error::InvariantViolation(format!(
                    "partition {} assigned twice",
                    partition
                )));
            }
        }
        Ok(Self { entries, index })
    }

    /// Fresh map: `q` partitions distributed round-robin over the sorted
    /// node set.
    pub fn create_partitions(q: u64, nodes: &[NodeId]) -> Result<Self> {
        if q == 0 || q > HASH_SPACE {
            return Err(Error::InvariantViolation(format!(
                "partition count {} outside 1..={}",
                q, HASH_SPACE
            )));
        }
        let nodes = sorted_unique(nodes);
        if nodes.is_empty() {
            return Err(Error::InvariantViolation(
                "partition map needs at least one node".into(),
            ));
        }

        let range = range_width(q);
        let entries = (0..q)
            .map(|i| (nodes[(i as usize) % nodes.len()].clone(), i * range))
            .collect();
        Self::from_entries(entries)
    }

    /// Reassign partitions for a new node set, minimizing churn: owners
    /// still present keep their partitions, orphans go to the least-loaded
    /// node, then partitions move greedily from the heaviest owner to the
    /// lightest until loads differ by at most one.
    pub fn map_partitions(&self, new_nodes: &[NodeId]) -> Result<Self> {
        let nodes = sorted_unique(new_nodes);
        if nodes.is_empty() {
            return Err(Error::InvariantViolation(
                "partition map needs at least one node".into(),
            ));
        }

        let members: HashSet<&NodeId> = nodes.iter().collect();
        let mut loads: BTreeMap<NodeId, usize> = nodes.iter().map(|m| (m.clone(), 0)).collect();
        let mut entries = self.entries.clone();

        let mut orphans = Vec::new();
        for (i, (owner, _)) in entries.iter().enumerate() {
            if members.contains(owner) {
                *loads.get_mut(owner).unwrap() += 1;
            } else {
                orphans.push(i);
            }
        }

        for i in orphans {
            let target = Self::least_loaded(&loads);
            entries[i].0 = target.clone();
            *loads.get_mut(&target).unwrap() += 1;
        }

        loop {
            let (heavy, heavy_load) = Self::most_loaded(&loads);
            let (light, light_load) = Self::least_loaded_with_count(&loads);
            if heavy_load - light_load <= 1 {
                break;
            }
            // Move the heaviest owner's lowest partition id; lowest-first
            // keeps the choice deterministic.
            let idx = entries
                .iter()
                .enumerate()
                .filter(|(_, (owner, _))| *owner == heavy)
                .min_by_key(|(_, (_, partition))| *partition)
                .map(|(i, _)| i)
                .unwrap();
            entries[idx].0 = light.clone();
            *loads.get_mut(&heavy).unwrap() -= 1;
            *loads.get_mut(&light).unwrap() += 1;
        }

        Self::from_entries(entries)
    }

    fn least_loaded(loads: &BTreeMap<NodeId, usize>) -> NodeId {
        Self::least_loaded_with_count(loads).0
    }

    // BTreeMap iterates in name order, so ties resolve to the first name.
    fn least_loaded_with_count(loads: &BTreeMap<NodeId, usize>) -> (NodeId, usize) {
        loads
            .iter()
            .min_by_key(|(_, load)| **load)
            .map(|(node, load)| (node.clone(), *load))
            .unwrap()
    }

    fn most_loaded(loads: &BTreeMap<NodeId, usize>) -> (NodeId, usize) {
        loads
            .iter()
            .max_by_key(|(_, load)| **load)
            .map(|(node, load)| (node.clone(), *load))
            .unwrap()
    }

    /// Owner of a partition, O(1).
    pub fn owner(&self, partition: PartitionId) -> Result<&NodeId> {
        self.index
            .get(&partition)
            .ok_or(Error::UnknownPartition(partition))
    }

    /// Partitions mastered by `node`, in partition-id order.
    pub fn owned_by(&self, node: &NodeId) -> Vec<PartitionId> {
        self.entries
            .iter()
            .filter(|(owner, _)| owner == node)
            .map(|(_, partition)| *partition)
            .collect()
    }

    pub fn entries(&self) -> &[(NodeId, PartitionId)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Partition count, the `q` this map was built with.
    pub fn q(&self) -> u64 {
        self.entries.len() as u64
    }
}

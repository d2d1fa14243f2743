//! Versioned membership state
//!
//! The convergent record every node gossips: the sorted node set, the
//! partition assignment, and a vector clock versioning both. `node` is
//! process-local identity and is never compared, merged, or persisted as
//! part of the convergent state.
//!
//! Persisted as `<directory>/<node>.bin`: a one-byte layout tag followed by
//! the bincode record. An untagged legacy layout (a flat 5-field record) is
//! still accepted on load and rewritten in the current layout.

use crate::cluster::partitions::{reverse_replicas, PartitionMap};
use crate::cluster::vclock::{Causality, VectorClock};
use crate::common::{Error, NodeId, PartitionId, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

const LAYOUT_TAG: u8 = 1;

/// Which partitions a node is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScope {
    /// Partitions the node owns.
    Master,
    /// Partitions the node holds any replica of.
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipState {
    node: NodeId,
    nodes: Vec<NodeId>,
    partitions: PartitionMap,
    version: VectorClock,
}

/// Current persisted layout, after the tag byte.
#[derive(Serialize, Deserialize)]
struct MembershipRecord {
    nodes: Vec<NodeId>,
    partitions: Vec<(NodeId, PartitionId)>,
    version: VectorClock,
}

/// Legacy untagged layout: `(record_tag, partitions, version, nodes, _)`.
/// The trailing slot held process-local state and is discarded.
type LegacyRecord = (
    String,
    Vec<(NodeId, PartitionId)>,
    VectorClock,
    Vec<NodeId>,
    Option<String>,
);

impl MembershipState {
    /// Fresh state for a starting cluster. `nodes` is the initial member
    /// set; `node` is added to it if absent.
    pub fn bootstrap(node: impl Into<NodeId>, nodes: &[NodeId], q: u64) -> Result<Self> {
        let node = node.into();
        let mut nodes = nodes.to_vec();
        if !nodes.contains(&node) {
            nodes.push(node.clone());
        }
        nodes.sort();
        nodes.dedup();

        let partitions = PartitionMap::create_partitions(q, &nodes)?;
        let version = VectorClock::create(&node);
        Ok(Self {
            node,
            nodes,
            partitions,
            version,
        })
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn partitions(&self) -> &PartitionMap {
        &self.partitions
    }

    pub fn version(&self) -> &VectorClock {
        &self.version
    }

    /// Add a node, rebalance, bump the version by this coordinator's actor
    /// id. Joining an existing member is a no-op.
    pub fn join(&self, newcomer: &NodeId) -> Result<Self> {
        if self.nodes.contains(newcomer) {
            return Ok(self.clone());
        }
        let mut nodes = self.nodes.clone();
        nodes.push(newcomer.clone());
        nodes.sort();

        Ok(Self {
            node: self.node.clone(),
            partitions: self.partitions.map_partitions(&nodes)?,
            nodes,
            version: self.version.increment(&self.node),
        })
    }

    /// Remove a node, rebalance, bump the version. Removing a non-member is
    /// a no-op.
    pub fn remove(&self, departing: &NodeId) -> Result<Self> {
        if !self.nodes.contains(departing) {
            return Ok(self.clone());
        }
        let nodes: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|m| *m != departing)
            .cloned()
            .collect();

        Ok(Self {
            node: self.node.clone(),
            partitions: self.partitions.map_partitions(&nodes)?,
            nodes,
            version: self.version.increment(&self.node),
        })
    }

    /// Administrative hard-remap: replace the partition assignment outright.
    /// Partition ids must match the current map and every owner must be a
    /// member.
    pub fn remap(&self, partitions: PartitionMap) -> Result<Self> {
        if partitions.len() != self.partitions.len() {
            return Err(Error::InvariantViolation(format!(
                "remap changes partition count from {} to {}",
                self.partitions.len(),
                partitions.len()
            )));
        }
        for ((_, current), (owner, replacement)) in
            self.partitions.entries().iter().zip(partitions.entries())
        {
            if current != replacement {
                return Err(Error::InvariantViolation(format!(
                    "remap replaces partition id {} with {}",
                    current, replacement
                )));
            }
            if !self.nodes.contains(owner) {
                return Err(Error::UnknownNode(owner.clone()));
            }
        }

        Ok(Self {
            node: self.node.clone(),
            nodes: self.nodes.clone(),
            partitions,
            version: self.version.increment(&self.node),
        })
    }

    /// Causal merge with a remote state. A dominated side adopts the
    /// dominant state wholesale; concurrent versions converge on the
    /// node-set union with a rebalanced map and the merged clock. Local
    /// identity is kept either way.
    ///
    /// For the concurrent case the rebalance base is the side with the
    /// lexicographically smaller entry sequence, so both sides of an
    /// exchange compute the same map and merge stays commutative.
    pub fn merge(&self, remote: &MembershipState) -> Result<Self> {
        match self.version.compare(&remote.version) {
            Causality::Equal | Causality::Greater => Ok(self.clone()),
            Causality::Less => Ok(Self {
                node: self.node.clone(),
                nodes: remote.nodes.clone(),
                partitions: remote.partitions.clone(),
                version: remote.version.clone(),
            }),
            Causality::Concurrent => {
                let mut nodes = self.nodes.clone();
                nodes.extend(remote.nodes.iter().cloned());
                nodes.sort();
                nodes.dedup();

                let base = if self.partitions.entries() <= remote.partitions.entries() {
                    &self.partitions
                } else {
                    &remote.partitions
                };

                Ok(Self {
                    node: self.node.clone(),
                    partitions: base.map_partitions(&nodes)?,
                    nodes,
                    version: self.version.merge(&remote.version),
                })
            }
        }
    }

    /// Partitions relevant to `node`: its own under `Master`, or everything
    /// it holds any replica of under `All` (the union of master partitions
    /// across its `n` reverse-replica nodes).
    pub fn partitions_for_node(
        &self,
        node: &NodeId,
        scope: PartitionScope,
        n: usize,
    ) -> Result<Vec<PartitionId>> {
        if !self.nodes.contains(node) {
            return Err(Error::UnknownNode(node.clone()));
        }
        match scope {
            PartitionScope::Master => Ok(self.partitions.owned_by(node)),
            PartitionScope::All => {
                let holders = reverse_replicas(node, n, &self.nodes)?;
                let mut partitions: Vec<PartitionId> = holders
                    .iter()
                    .flat_map(|holder| self.partitions.owned_by(holder))
                    .collect();
                partitions.sort_unstable();
                partitions.dedup();
                Ok(partitions)
            }
        }
    }

    fn file_path(directory: &Path, node: &NodeId) -> PathBuf {
        directory.join(format!("{}.bin", node))
    }

    /// Persist atomically: temp file in the same directory, then rename.
    pub fn save(&self, directory: &Path) -> Result<()> {
        std::fs::create_dir_all(directory)?;

        let record = MembershipRecord {
            nodes: self.nodes.clone(),
            partitions: self.partitions.entries().to_vec(),
            version: self.version.clone(),
        };
        let mut buf = vec![LAYOUT_TAG];
        buf.extend(
            bincode::serialize(&record)
                .map_err(|e| Error::Other(format!("serialize membership: {}", e)))?,
        );

        let path = Self::file_path(directory, &self.node);
        let tmp = path.with_extension("bin.tmp");
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load this node's state from disk. `Ok(None)` when no file exists
    /// yet. A legacy-layout file is upgraded in place.
    pub fn load(directory: &Path, node: &NodeId) -> Result<Option<Self>> {
        let path = Self::file_path(directory, node);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            return Err(Error::Corrupted(format!("{} is empty", path.display())));
        }

        let (record, legacy) = Self::decode(&bytes, &path)?;
        let state = Self::from_record(node.clone(), record, &path)?;
        if legacy {
            info!(node = %node, "upgrading membership file from legacy layout");
            state.save(directory)?;
        }
        Ok(Some(state))
    }

    fn decode(bytes: &[u8], path: &Path) -> Result<(MembershipRecord, bool)> {
        if bytes[0] == LAYOUT_TAG {
            if let Ok(record) = bincode::deserialize::<MembershipRecord>(&bytes[1..]) {
                return Ok((record, false));
            }
        }
        let (_, partitions, version, nodes, _) = bincode::deserialize::<LegacyRecord>(bytes)
            .map_err(|e| Error::Corrupted(format!("{}: {}", path.display(), e)))?;
        Ok((
            MembershipRecord {
                nodes,
                partitions,
                version,
            },
            true,
        ))
    }

    fn from_record(node: NodeId, record: MembershipRecord, path: &Path) -> Result<Self> {
        let partitions = PartitionMap::from_entries(record.partitions)
            .map_err(|e| Error::Corrupted(format!("{}: {}", path.display(), e)))?;
        for (owner, partition) in partitions.entries() {
            if !record.nodes.contains(owner) {
                return Err(Error::Corrupted(format!(
                    "{}: partition {} owned by unknown node {}",
                    path.display(),
                    partition,
                    owner
                )));
            }
        }
        Ok(Self {
            node,
            nodes: record.nodes,
            partitions,
            version: record.version,
        })
    }
}

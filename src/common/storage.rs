//! Storage endpoint abstraction
//!
//! The mediator addresses replica storage by the structured pair
//! `(partition, node)`; resolving that pair to a network address is the
//! transport's business, not ours. [`MemoryEndpoint`] is an in-process
//! implementation with fault injection, used by the integration tests to
//! stand in a whole cluster.

use crate::cluster::vclock::{Causality, VectorClock, VersionedValue};
use crate::common::{NodeId, PartitionId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors a single replica endpoint can report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("i/o: {0}")]
    Io(String),

    #[error("timeout")]
    Timeout,
}

/// Per-replica storage contract. One logical endpoint per `(partition, node)`
/// pair; implementations resolve the pair to wherever the data lives.
#[async_trait]
pub trait StorageEndpoint: Send + Sync {
    async fn get(
        &self,
        partition: PartitionId,
        node: &NodeId,
        key: &str,
    ) -> StorageResult<VersionedValue>;

    async fn put(
        &self,
        partition: PartitionId,
        node: &NodeId,
        key: &str,
        clock: VectorClock,
        value: Vec<u8>,
    ) -> StorageResult<()>;

    async fn has_key(&self, partition: PartitionId, node: &NodeId, key: &str)
        -> StorageResult<bool>;

    async fn delete(
        &self,
        partition: PartitionId,
        node: &NodeId,
        key: &str,
        timeout_ms: u64,
    ) -> StorageResult<()>;
}

#[derive(Default)]
struct SimState {
    // (node, partition) -> key -> sibling frontier, oldest first
    data: HashMap<(NodeId, PartitionId), HashMap<String, Vec<VersionedValue>>>,
    down: HashSet<NodeId>,
    // network split groups; empty means fully connected
    groups: Vec<HashSet<NodeId>>,
}

impl SimState {
    fn check_reachable(&self, caller: &NodeId, target: &NodeId) -> StorageResult<()> {
        if self.down.contains(target) {
            return Err(StorageError::Timeout);
        }
        if caller == target || self.groups.is_empty() {
            return Ok(());
        }
        let same_side = self
            .groups
            .iter()
            .any(|g| g.contains(caller) && g.contains(target));
        if same_side {
            Ok(())
        } else {
            Err(StorageError::Timeout)
        }
    }
}

/// Shared in-process cluster simulation. Hand out one [`MemoryEndpoint`] per
/// node; they all see the same stored data and the same injected faults.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<Mutex<SimState>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoint as seen from `node`: calls are subject to that node's
    /// side of any injected network split.
    pub fn endpoint(&self, node: impl Into<NodeId>) -> Arc<MemoryEndpoint> {
        Arc::new(MemoryEndpoint {
            caller: node.into(),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Take a node down; every call targeting it times out.
    pub fn kill(&self, node: &str) {
        self.inner.lock().unwrap().down.insert(node.to_string());
    }

    pub fn revive(&self, node: &str) {
        self.inner.lock().unwrap().down.remove(node);
    }

    /// Partition the network into disjoint groups. Calls crossing group
    /// boundaries time out.
    pub fn split(&self, groups: Vec<Vec<NodeId>>) {
        self.inner.lock().unwrap().groups =
            groups.into_iter().map(|g| g.into_iter().collect()).collect();
    }

    /// Heal all network splits.
    pub fn heal(&self) {
        self.inner.lock().unwrap().groups.clear();
    }

    /// Inspect what a replica holds for a key, siblings included.
    pub fn stored(&self, node: &str, partition: PartitionId, key: &str) -> Vec<VersionedValue> {
        self.inner
            .lock()
            .unwrap()
            .data
            .get(&(node.to_string(), partition))
            .and_then(|keys| keys.get(key))
            .cloned()
            .unwrap_or_default()
    }
}

/// One node's view of a [`MemoryCluster`].
pub struct MemoryEndpoint {
    caller: NodeId,
    inner: Arc<Mutex<SimState>>,
}

#[async_trait]
impl StorageEndpoint for MemoryEndpoint {
    async fn get(
        &self,
        partition: PartitionId,
        node: &NodeId,
        key: &str,
    ) -> StorageResult<VersionedValue> {
        let state = self.inner.lock().unwrap();
        state.check_reachable(&self.caller, node)?;
        state
            .data
            .get(&(node.clone(), partition))
            .and_then(|keys| keys.get(key))
            .and_then(|siblings| siblings.last())
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn put(
        &self,
        partition: PartitionId,
        node: &NodeId,
        key: &str,
        clock: VectorClock,
        value: Vec<u8>,
    ) -> StorageResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.check_reachable(&self.caller, node)?;
        let siblings = state
            .data
            .entry((node.clone(), partition))
            .or_default()
            .entry(key.to_string())
            .or_default();

        // Keep the sibling frontier: drop values the new clock dominates,
        // skip the insert when an existing value dominates the new one.
        let mut dominated = false;
        siblings.retain(|existing| match existing.clock.compare(&clock) {
            Causality::Less => false,
            Causality::Equal | Causality::Greater => {
                dominated = true;
                true
            }
            Causality::Concurrent => true,
        });
        if !dominated {
            siblings.push(VersionedValue { clock, value });
        }
        Ok(())
    }

    async fn has_key(
        &self,
        partition: PartitionId,
        node: &NodeId,
        key: &str,
    ) -> StorageResult<bool> {
        let state = self.inner.lock().unwrap();
        state.check_reachable(&self.caller, node)?;
        Ok(state
            .data
            .get(&(node.clone(), partition))
            .and_then(|keys| keys.get(key))
            .is_some_and(|siblings| !siblings.is_empty()))
    }

    async fn delete(
        &self,
        partition: PartitionId,
        node: &NodeId,
        key: &str,
        _timeout_ms: u64,
    ) -> StorageResult<()> {
        let mut state = self.inner.lock().unwrap();
        state.check_reachable(&self.caller, node)?;
        if let Some(keys) = state.data.get_mut(&(node.clone(), partition)) {
            keys.remove(key);
        }
        Ok(())
    }
}

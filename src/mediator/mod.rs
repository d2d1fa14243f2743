//! Request mediation: quorum reads and writes
//!
//! A client call turns into an N-way fanout over the key's replica set,
//! and the verdict is a count: at least W good replies for writes, R for
//! reads. The replica set comes from the routing snapshot, so request
//! handling never waits on the membership actor.
//!
//! The fanout waits for every replica to report even after quorum is
//! reached; the failure list in a diagnostic is complete, and a read can
//! tell "not found by quorum" from "too many errors".

use crate::cluster::partitions::{partition_for_hash, replicas};
use crate::cluster::service::RoutingTable;
use crate::cluster::vclock::{reconcile, Resolution, VectorClock};
use crate::common::storage::{StorageEndpoint, StorageError, StorageResult};
use crate::common::{Config, Error, Hasher, NodeId, PartitionId, QuorumDiagnostic, Result};
use futures::future;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Per-replica deadline for delete fanout.
const DELETE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fan out one storage call per replica, wait for every reply, and split
/// the results into good replies and per-node failures. No early exit on
/// quorum.
async fn pcall<T, F, Fut>(
    replica_set: Vec<NodeId>,
    call: F,
) -> (Vec<(NodeId, T)>, Vec<(NodeId, StorageError)>)
where
    F: Fn(NodeId) -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let calls = replica_set.into_iter().map(|node| {
        let fut = call(node.clone());
        async move { (node, fut.await) }
    });

    let mut good = Vec::new();
    let mut bad = Vec::new();
    for (node, result) in future::join_all(calls).await {
        match result {
            Ok(value) => good.push((node, value)),
            Err(e) => bad.push((node, e)),
        }
    }
    (good, bad)
}

pub struct Mediator {
    node: NodeId,
    n: usize,
    r: usize,
    w: usize,
    table: Arc<RoutingTable>,
    storage: Arc<dyn StorageEndpoint>,
    hasher: Arc<dyn Hasher>,
}

impl Mediator {
    pub fn new(
        node: impl Into<NodeId>,
        config: &Config,
        table: Arc<RoutingTable>,
        storage: Arc<dyn StorageEndpoint>,
        hasher: Arc<dyn Hasher>,
    ) -> Self {
        Self {
            node: node.into(),
            n: config.n,
            r: config.r,
            w: config.w,
            table,
            storage,
            hasher,
        }
    }

    /// Replica set for a key, from the current routing snapshot: the
    /// partition owner plus its ring successors.
    fn replica_set(&self, key: &str) -> Result<(PartitionId, Vec<NodeId>)> {
        let snapshot = self.table.snapshot();
        let partition = partition_for_hash(self.hasher.hash(key), snapshot.q());
        let owner = snapshot.partitions().owner(partition)?.clone();
        let set = replicas(&owner, self.n, snapshot.nodes())?;
        Ok((partition, set))
    }

    fn quorum_unmet(
        &self,
        op: &'static str,
        key: &str,
        good: usize,
        required: usize,
        bad: Vec<(NodeId, StorageError)>,
    ) -> Error {
        let diagnostic = QuorumDiagnostic {
            op,
            key: key.to_string(),
            good,
            required,
            n: self.n,
            bad,
        };
        warn!(%diagnostic, "quorum not met");
        Error::QuorumUnmet(diagnostic)
    }

    /// Write a value under the client's context clock, incremented by this
    /// coordinator. Succeeds with the replica count once at least W
    /// replicas stored it.
    pub async fn put(&self, key: &str, context: &VectorClock, value: Vec<u8>) -> Result<usize> {
        let (partition, replica_set) = self.replica_set(key)?;
        let clock = context.increment(&self.node);

        let storage = &self.storage;
        let (good, bad) = pcall(replica_set, |node| {
            let clock = clock.clone();
            let value = value.clone();
            async move { storage.put(partition, &node, key, clock, value).await }
        })
        .await;

        if good.len() >= self.w {
            Ok(good.len())
        } else {
            Err(self.quorum_unmet("put", key, good.len(), self.w, bad))
        }
    }

    /// Read a key from its replicas and reconcile the replies by vector
    /// clock. `Ok(None)` means at least R replicas agreed the key is
    /// absent; concurrent survivors come back together as siblings.
    pub async fn get(&self, key: &str) -> Result<Option<Resolution>> {
        let (partition, replica_set) = self.replica_set(key)?;

        let storage = &self.storage;
        let (good, bad) = pcall(replica_set, |node| async move {
            storage.get(partition, &node, key).await
        })
        .await;

        if good.len() >= self.r {
            let values = good.into_iter().map(|(_, value)| value).collect();
            return Ok(Some(reconcile(values)));
        }

        let absent = bad
            .iter()
            .filter(|(_, e)| matches!(e, StorageError::NotFound))
            .count();
        if absent >= self.r {
            return Ok(None);
        }

        Err(self.quorum_unmet("get", key, good.len(), self.r, bad))
    }

    /// Whether the key exists, by read quorum: the answer must be agreed
    /// on by at least R good replies. Returns the boolean with the number
    /// of replicas backing it.
    pub async fn has_key(&self, key: &str) -> Result<(bool, usize)> {
        let (partition, replica_set) = self.replica_set(key)?;

        let storage = &self.storage;
        let (good, bad) = pcall(replica_set, |node| async move {
            storage.has_key(partition, &node, key).await
        })
        .await;

        let present = good.iter().filter(|(_, held)| *held).count();
        let missing = good.len() - present;
        if present >= self.r {
            return Ok((true, present));
        }
        if missing >= self.r {
            return Ok((false, missing));
        }

        Err(self.quorum_unmet("has_key", key, good.len(), self.r, bad))
    }

    /// Delete a key from its replicas under a per-replica deadline,
    /// counted against the write quorum.
    pub async fn delete(&self, key: &str) -> Result<usize> {
        let (partition, replica_set) = self.replica_set(key)?;
        let timeout_ms = DELETE_TIMEOUT.as_millis() as u64;

        let storage = &self.storage;
        let (good, bad) = pcall(replica_set, |node| async move {
            match tokio::time::timeout(
                DELETE_TIMEOUT,
                storage.delete(partition, &node, key, timeout_ms),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StorageError::Timeout),
            }
        })
        .await;

        if good.len() >= self.w {
            Ok(good.len())
        } else {
            Err(self.quorum_unmet("delete", key, good.len(), self.w, bad))
        }
    }
}

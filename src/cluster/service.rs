//! Membership actor
//!
//! One task owns the [`MembershipState`]; everything else talks to it over
//! a bounded command channel. Two things escape the actor for the hot
//! path: a routing snapshot the mediator reads without any channel round
//! trip, and a watch channel telling the storage layer which partitions
//! this node now holds so it can start/stop per-partition workers.
//!
//! Installing a new state is persist-then-commit: if the save fails the
//! old state stays in force and the caller gets the error.

use crate::cluster::membership::{MembershipState, PartitionScope};
use crate::cluster::partitions::PartitionMap;
use crate::common::{Config, Error, NodeId, PartitionId, Result};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const COMMAND_QUEUE_DEPTH: usize = 64;

/// Immutable routing view: node set plus partition assignment. Replaced
/// wholesale on every membership change.
#[derive(Debug, Clone)]
pub struct RoutingSnapshot {
    nodes: Vec<NodeId>,
    partitions: PartitionMap,
}

impl RoutingSnapshot {
    fn of(state: &MembershipState) -> Self {
        Self {
            nodes: state.nodes().to_vec(),
            partitions: state.partitions().clone(),
        }
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn partitions(&self) -> &PartitionMap {
        &self.partitions
    }

    pub fn q(&self) -> u64 {
        self.partitions.q()
    }
}

/// Read-optimized owner index shared outside the actor. Readers take an
/// `Arc` snapshot; the actor swaps in a fresh one atomically.
#[derive(Debug)]
pub struct RoutingTable {
    inner: RwLock<Arc<RoutingSnapshot>>,
}

impl RoutingTable {
    fn new(snapshot: RoutingSnapshot) -> Self {
        Self {
            inner: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        Arc::clone(&self.inner.read().unwrap())
    }

    fn install(&self, snapshot: RoutingSnapshot) {
        *self.inner.write().unwrap() = Arc::new(snapshot);
    }
}

/// What this node is now responsible for, published after every install.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnershipUpdate {
    /// Partitions this node owns.
    pub master: Vec<PartitionId>,
    /// Partitions this node holds any replica of.
    pub replicas: Vec<PartitionId>,
}

enum Command {
    Join {
        node: NodeId,
        reply: oneshot::Sender<Result<MembershipState>>,
    },
    Remove {
        node: NodeId,
        reply: oneshot::Sender<Result<MembershipState>>,
    },
    Remap {
        partitions: PartitionMap,
        reply: oneshot::Sender<Result<MembershipState>>,
    },
    Merge {
        remote: Box<MembershipState>,
        reply: Option<oneshot::Sender<Result<MembershipState>>>,
    },
    Snapshot {
        reply: oneshot::Sender<MembershipState>,
    },
    PartitionsFor {
        node: NodeId,
        scope: PartitionScope,
        reply: oneshot::Sender<Result<Vec<PartitionId>>>,
    },
}

/// Cloneable handle to the membership actor. Dropping a pending call just
/// discards the reply; the actor is unaffected.
#[derive(Clone)]
pub struct MembershipHandle {
    tx: mpsc::Sender<Command>,
}

impl MembershipHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::ServiceClosed)?;
        rx.await.map_err(|_| Error::ServiceClosed)
    }

    pub async fn join(&self, node: NodeId) -> Result<MembershipState> {
        self.request(|reply| Command::Join { node, reply }).await?
    }

    pub async fn remove(&self, node: NodeId) -> Result<MembershipState> {
        self.request(|reply| Command::Remove { node, reply }).await?
    }

    pub async fn remap(&self, partitions: PartitionMap) -> Result<MembershipState> {
        self.request(|reply| Command::Remap { partitions, reply })
            .await?
    }

    /// Merge a remote state and return what got installed.
    pub async fn merge(&self, remote: MembershipState) -> Result<MembershipState> {
        self.request(|reply| Command::Merge {
            remote: Box::new(remote),
            reply: Some(reply),
        })
        .await?
    }

    /// One-way merge push, fire and forget. Gossip uses this so the
    /// exchange never blocks on the actor's reply.
    pub async fn push(&self, remote: MembershipState) {
        let _ = self
            .tx
            .send(Command::Merge {
                remote: Box::new(remote),
                reply: None,
            })
            .await;
    }

    pub async fn snapshot(&self) -> Result<MembershipState> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn partitions_for(
        &self,
        node: NodeId,
        scope: PartitionScope,
    ) -> Result<Vec<PartitionId>> {
        self.request(|reply| Command::PartitionsFor { node, scope, reply })
            .await?
    }
}

pub struct MembershipService {
    state: MembershipState,
    n: usize,
    directory: PathBuf,
    table: Arc<RoutingTable>,
    ownership: watch::Sender<OwnershipUpdate>,
    rx: mpsc::Receiver<Command>,
}

impl MembershipService {
    /// Persist the initial state and start the actor task.
    pub fn spawn(
        state: MembershipState,
        config: &Config,
    ) -> Result<(
        MembershipHandle,
        Arc<RoutingTable>,
        watch::Receiver<OwnershipUpdate>,
        JoinHandle<()>,
    )> {
        state.save(&config.directory)?;

        let table = Arc::new(RoutingTable::new(RoutingSnapshot::of(&state)));
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (ownership, ownership_rx) = watch::channel(OwnershipUpdate::default());

        let service = Self {
            state,
            n: config.n,
            directory: config.directory.clone(),
            table: Arc::clone(&table),
            ownership,
            rx,
        };
        service.publish_ownership();

        let task = tokio::spawn(service.run());
        Ok((MembershipHandle { tx }, table, ownership_rx, task))
    }

    async fn run(mut self) {
        debug!(node = %self.state.node(), "membership service running");
        while let Some(cmd) = self.rx.recv().await {
            self.handle(cmd);
        }
        debug!("membership service stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Join { node, reply } => {
                let result = self
                    .state
                    .join(&node)
                    .and_then(|next| self.install(next));
                let _ = reply.send(result);
            }
            Command::Remove { node, reply } => {
                let result = self
                    .state
                    .remove(&node)
                    .and_then(|next| self.install(next));
                let _ = reply.send(result);
            }
            Command::Remap { partitions, reply } => {
                let result = self
                    .state
                    .remap(partitions)
                    .and_then(|next| self.install(next));
                let _ = reply.send(result);
            }
            Command::Merge { remote, reply } => {
                let result = self
                    .state
                    .merge(&remote)
                    .and_then(|next| self.install(next));
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            warn!(error = %e, "pushed merge failed");
                        }
                    }
                }
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.state.clone());
            }
            Command::PartitionsFor { node, scope, reply } => {
                let _ = reply.send(self.state.partitions_for_node(&node, scope, self.n));
            }
        }
    }

    /// Persist, commit, and broadcast a mutated state. Unchanged states
    /// skip the side effects.
    fn install(&mut self, next: MembershipState) -> Result<MembershipState> {
        if next == self.state {
            return Ok(next);
        }

        next.save(&self.directory)?;
        self.state = next.clone();
        self.table.install(RoutingSnapshot::of(&self.state));
        self.publish_ownership();
        info!(
            node = %self.state.node(),
            members = self.state.nodes().len(),
            "installed membership state"
        );
        Ok(next)
    }

    fn publish_ownership(&self) {
        let node = self.state.node().clone();
        let master = self
            .state
            .partitions_for_node(&node, PartitionScope::Master, self.n)
            .unwrap_or_default();
        let replicas = self
            .state
            .partitions_for_node(&node, PartitionScope::All, self.n)
            .unwrap_or_default();
        self.ownership
            .send_replace(OwnershipUpdate { master, replicas });
    }
}

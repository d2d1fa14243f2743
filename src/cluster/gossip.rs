//! Anti-entropy gossip
//!
//! Each node runs one gossip task: sleep a random 5-10s, pick a random
//! peer, pull its state, merge, and push the merged result back. Merge is
//! commutative, associative, and idempotent on the clock lattice, so
//! repeated rounds converge every view without a coordinator. A failed
//! round is dropped on the floor; the next tick picks another peer.

use crate::cluster::membership::MembershipState;
use crate::cluster::service::MembershipHandle;
use crate::cluster::vclock::Causality;
use crate::common::{NodeId, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

const GOSSIP_MIN: Duration = Duration::from_secs(5);
const GOSSIP_MAX: Duration = Duration::from_secs(10);

/// State exchange with a peer, implemented by the network layer.
#[async_trait]
pub trait GossipTransport: Send + Sync {
    async fn get_state(&self, peer: &NodeId) -> Result<MembershipState>;
    async fn push_state(&self, peer: &NodeId, state: MembershipState) -> Result<()>;
}

pub struct Gossiper {
    node: NodeId,
    membership: MembershipHandle,
    transport: Arc<dyn GossipTransport>,
}

/// Pause, resume, or tear down a spawned gossip loop.
pub struct GossipControl {
    running: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl GossipControl {
    /// Pause the loop after the current round.
    pub fn stop(&self) {
        let _ = self.running.send(false);
    }

    /// Resume a paused loop.
    pub fn start(&self) {
        let _ = self.running.send(true);
    }

    /// End the loop for good.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Gossiper {
    pub fn new(
        node: impl Into<NodeId>,
        membership: MembershipHandle,
        transport: Arc<dyn GossipTransport>,
    ) -> Self {
        Self {
            node: node.into(),
            membership,
            transport,
        }
    }

    /// One push-pull round with a chosen peer. Pull the peer's state; if
    /// the versions already agree there is nothing to send. Otherwise merge,
    /// install the result locally (one-way push, never waiting on the
    /// membership actor), and hand the merged state to the peer.
    pub async fn round_with(&self, peer: &NodeId) -> Result<()> {
        let local = self.membership.snapshot().await?;
        let remote = self.transport.get_state(peer).await?;
        if local.version().compare(remote.version()) == Causality::Equal {
            return Ok(());
        }

        let merged = local.merge(&remote)?;
        self.membership.push(merged.clone()).await;
        self.transport.push_state(peer, merged).await?;
        Ok(())
    }

    /// One round with a random peer. No peers, no round.
    pub async fn round(&self) -> Result<()> {
        let local = self.membership.snapshot().await?;
        let peers: Vec<&NodeId> = local.nodes().iter().filter(|m| *m != &self.node).collect();
        if peers.is_empty() {
            return Ok(());
        }
        let peer = {
            let mut rng = rand::thread_rng();
            peers[rng.gen_range(0..peers.len())].clone()
        };
        self.round_with(&peer).await
    }

    /// Run the gossip loop until shut down. `stop` pauses ticking until a
    /// matching `start`.
    pub fn spawn(self) -> GossipControl {
        let (running, mut paused) = watch::channel(true);
        let task = tokio::spawn(async move {
            loop {
                let delay = {
                    let mut rng = rand::thread_rng();
                    Duration::from_millis(
                        rng.gen_range(GOSSIP_MIN.as_millis() as u64..=GOSSIP_MAX.as_millis() as u64),
                    )
                };
                tokio::time::sleep(delay).await;

                while !*paused.borrow() {
                    if paused.changed().await.is_err() {
                        return;
                    }
                }

                if let Err(e) = self.round().await {
                    debug!(node = %self.node, error = %e, "gossip round aborted");
                }
            }
        });
        GossipControl { running, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::service::MembershipService;
    use crate::common::{Config, Error};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// In-process transport: peers are membership handles in the same
    /// runtime. Pushes apply synchronously so tests see the result.
    #[derive(Default)]
    struct LocalTransport {
        handles: std::sync::Mutex<HashMap<NodeId, MembershipHandle>>,
        pushes: AtomicUsize,
    }

    impl LocalTransport {
        fn register(&self, node: &str, handle: MembershipHandle) {
            self.handles
                .lock()
                .unwrap()
                .insert(node.to_string(), handle);
        }

        fn handle(&self, peer: &NodeId) -> Result<MembershipHandle> {
            self.handles
                .lock()
                .unwrap()
                .get(peer)
                .cloned()
                .ok_or_else(|| Error::PeerUnavailable(peer.clone()))
        }
    }

    #[async_trait]
    impl GossipTransport for LocalTransport {
        async fn get_state(&self, peer: &NodeId) -> Result<MembershipState> {
            self.handle(peer)?.snapshot().await
        }

        async fn push_state(&self, peer: &NodeId, state: MembershipState) -> Result<()> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            self.handle(peer)?.merge(state).await.map(|_| ())
        }
    }

    fn nodes(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn round_converges_divergent_views() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.directory = dir.path().to_path_buf();

        let state_a = MembershipState::bootstrap("a", &nodes(&["a", "b"]), 8).unwrap();
        let state_b = MembershipState::bootstrap("b", &nodes(&["a", "b"]), 8).unwrap();
        let (handle_a, _, _, _task_a) = MembershipService::spawn(state_a, &config).unwrap();
        let (handle_b, _, _, _task_b) = MembershipService::spawn(state_b, &config).unwrap();

        // a learns about d while b is behind
        handle_a.join("d".to_string()).await.unwrap();

        let transport = Arc::new(LocalTransport::default());
        transport.register("a", handle_a.clone());
        transport.register("b", handle_b.clone());

        let gossiper = Gossiper::new("a", handle_a.clone(), transport.clone());
        gossiper.round_with(&"b".to_string()).await.unwrap();

        // the one-way local push lands before the next command is served
        let view_a = handle_a.snapshot().await.unwrap();
        let view_b = handle_b.snapshot().await.unwrap();
        assert_eq!(view_a.nodes(), view_b.nodes());
        assert!(view_a.nodes().contains(&"d".to_string()));
        assert_eq!(
            view_a.version().compare(view_b.version()),
            Causality::Equal
        );
    }

    #[tokio::test]
    async fn equal_versions_terminate_without_traffic() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.directory = dir.path().to_path_buf();

        let state_a = MembershipState::bootstrap("a", &nodes(&["a", "b"]), 8).unwrap();
        let state_b = MembershipState::bootstrap("b", &nodes(&["a", "b"]), 8).unwrap();
        let (handle_a, _, _, _task_a) = MembershipService::spawn(state_a, &config).unwrap();
        let (handle_b, _, _, _task_b) = MembershipService::spawn(state_b, &config).unwrap();

        let transport = Arc::new(LocalTransport::default());
        transport.register("a", handle_a.clone());
        transport.register("b", handle_b.clone());

        // first round converges the two views
        let gossiper = Gossiper::new("a", handle_a, transport.clone());
        gossiper.round_with(&"b".to_string()).await.unwrap();
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 1);

        // second round sees equal versions and sends nothing
        gossiper.round_with(&"b".to_string()).await.unwrap();
        assert_eq!(transport.pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_peer_aborts_round() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.directory = dir.path().to_path_buf();

        let state = MembershipState::bootstrap("a", &nodes(&["a", "b"]), 8).unwrap();
        let (handle_a, _, _, _task) = MembershipService::spawn(state, &config).unwrap();

        let transport = Arc::new(LocalTransport::default());
        transport.register("a", handle_a.clone());

        let gossiper = Gossiper::new("a", handle_a, transport);
        assert!(gossiper.round_with(&"b".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn round_without_peers_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.directory = dir.path().to_path_buf();

        let state = MembershipState::bootstrap("a", &[], 8).unwrap();
        let (handle, _, _, _task) = MembershipService::spawn(state, &config).unwrap();

        let gossiper = Gossiper::new("a", handle, Arc::new(LocalTransport::default()));
        gossiper.round().await.unwrap();
    }
}

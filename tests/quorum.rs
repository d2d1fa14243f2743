//! End-to-end quorum scenarios over an in-process cluster
//!
//! N=3, R=2, W=2, Q=8, nodes a/b/c, and a hasher pinning "apple" into the
//! fourth partition so every scenario exercises a known replica set.

use async_trait::async_trait;
use dynkv::cluster::{
    Causality, GossipTransport, Gossiper, MembershipHandle, MembershipService, MembershipState,
    PartitionScope, Resolution,
};
use dynkv::common::{Blake3Hasher, Error, Hasher, MemoryCluster, HASH_SPACE};
use dynkv::{Config, Mediator, NodeId, VectorClock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const Q: u64 = 8;

fn partition_of_apple() -> u64 {
    3 * (HASH_SPACE / Q)
}

/// Deterministic hasher: "apple" lands in the fourth partition, everything
/// else falls back to the default.
struct PinnedHasher;

impl Hasher for PinnedHasher {
    fn hash(&self, key: &str) -> u64 {
        if key == "apple" {
            partition_of_apple() + 17
        } else {
            Blake3Hasher.hash(key)
        }
    }
}

struct TestNode {
    handle: MembershipHandle,
    mediator: Mediator,
}

struct TestCluster {
    _dir: TempDir,
    sim: MemoryCluster,
    nodes: HashMap<NodeId, TestNode>,
}

impl TestCluster {
    fn node(&self, name: &str) -> &TestNode {
        &self.nodes[&name.to_string()]
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

fn spawn_cluster(names: &[&str]) -> TestCluster {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let sim = MemoryCluster::new();
    let members: Vec<NodeId> = names.iter().map(|s| s.to_string()).collect();

    let mut nodes = HashMap::new();
    for name in names {
        let mut config = Config::default();
        config.directory = dir.path().to_path_buf();

        let state = MembershipState::bootstrap(*name, &members, Q).unwrap();
        let (handle, table, _ownership, _task) = MembershipService::spawn(state, &config).unwrap();
        let mediator = Mediator::new(
            *name,
            &config,
            table,
            sim.endpoint(*name),
            Arc::new(PinnedHasher),
        );
        nodes.insert(name.to_string(), TestNode { handle, mediator });
    }

    TestCluster {
        _dir: dir,
        sim,
        nodes,
    }
}

/// In-process gossip transport over the cluster's membership handles.
#[derive(Default)]
struct LocalTransport {
    handles: Mutex<HashMap<NodeId, MembershipHandle>>,
}

impl LocalTransport {
    fn of(cluster: &TestCluster) -> Arc<Self> {
        let transport = Self::default();
        for (name, node) in &cluster.nodes {
            transport
                .handles
                .lock()
                .unwrap()
                .insert(name.clone(), node.handle.clone());
        }
        Arc::new(transport)
    }

    fn register(&self, name: &str, handle: MembershipHandle) {
        self.handles
            .lock()
            .unwrap()
            .insert(name.to_string(), handle);
    }

    fn lookup(&self, peer: &NodeId) -> dynkv::Result<MembershipHandle> {
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
    async fn get_state(&self, peer: &NodeId) -> dynkv::Result<MembershipState> {
        self.lookup(peer)?.snapshot().await
    }

    async fn push_state(&self, peer: &NodeId, state: MembershipState) -> dynkv::Result<()> {
        self.lookup(peer)?.merge(state).await.map(|_| ())
    }
}

// S1: put with all replicas up stores the coordinator's clock everywhere
#[tokio::test]
async fn s1_put_reaches_all_replicas() {
    let cluster = spawn_cluster(&["a", "b", "c"]);

    let written = cluster
        .node("a")
        .mediator
        .put("apple", &VectorClock::new(), b"v1".to_vec())
        .await
        .unwrap();
    assert_eq!(written, 3);

    for replica in ["a", "b", "c"] {
        let stored = cluster.sim.stored(replica, partition_of_apple(), "apple");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].value, b"v1");
        assert_eq!(stored[0].clock, VectorClock::create("a"));
    }
}

// S2: read-your-write on a quiescent cluster (R + W > N)
#[tokio::test]
async fn s2_get_after_put_returns_the_value() {
    let cluster = spawn_cluster(&["a", "b", "c"]);
    let mediator = &cluster.node("a").mediator;

    mediator
        .put("apple", &VectorClock::new(), b"v1".to_vec())
        .await
        .unwrap();

    match mediator.get("apple").await.unwrap() {
        Some(Resolution::Single(vv)) => assert_eq!(vv.value, b"v1"),
        other => panic!("unexpected read result: {:?}", other),
    }
}

// S3: a dead replica costs one ack, quorum still holds
#[tokio::test]
async fn s3_put_with_one_replica_down() {
    let cluster = spawn_cluster(&["a", "b", "c"]);
    let mediator = &cluster.node("a").mediator;

    mediator
        .put("apple", &VectorClock::new(), b"v1".to_vec())
        .await
        .unwrap();
    let prev_clock = VectorClock::create("a");

    cluster.sim.kill("c");
    let written = mediator
        .put("apple", &prev_clock, b"v2".to_vec())
        .await
        .unwrap();
    assert_eq!(written, 2);
}

// S4: read with the same replica still down returns the newest value
#[tokio::test]
async fn s4_get_with_one_replica_down() {
    let cluster = spawn_cluster(&["a", "b", "c"]);
    let mediator = &cluster.node("a").mediator;

    mediator
        .put("apple", &VectorClock::new(), b"v1".to_vec())
        .await
        .unwrap();
    cluster.sim.kill("c");
    mediator
        .put("apple", &VectorClock::create("a"), b"v2".to_vec())
        .await
        .unwrap();

    match mediator.get("apple").await.unwrap() {
        Some(Resolution::Single(vv)) => {
            assert_eq!(vv.value, b"v2");
            assert_eq!(vv.clock.counter("a"), 2);
        }
        other => panic!("unexpected read result: {:?}", other),
    }
}

// S5: writes on both sides of a split surface as siblings after healing
#[tokio::test]
async fn s5_split_brain_preserves_siblings() {
    let cluster = spawn_cluster(&["a", "b", "c"]);
    cluster.sim.split(vec![
        vec!["a".to_string()],
        vec!["b".to_string(), "c".to_string()],
    ]);

    // minority side cannot meet W, but its write still lands locally
    let minority = cluster
        .node("a")
        .mediator
        .put("apple", &VectorClock::new(), b"x".to_vec())
        .await;
    assert!(matches!(minority, Err(Error::QuorumUnmet(_))));

    let written = cluster
        .node("b")
        .mediator
        .put("apple", &VectorClock::new(), b"y".to_vec())
        .await
        .unwrap();
    assert_eq!(written, 2);

    cluster.sim.heal();

    match cluster.node("a").mediator.get("apple").await.unwrap() {
        Some(Resolution::Siblings(siblings)) => {
            assert_eq!(siblings.len(), 2);
            let values: Vec<&[u8]> = siblings.iter().map(|vv| vv.value.as_slice()).collect();
            assert!(values.contains(&b"x".as_slice()));
            assert!(values.contains(&b"y".as_slice()));
            for vv in &siblings {
                for other in &siblings {
                    if vv != other {
                        assert_eq!(vv.clock.compare(&other.clock), Causality::Concurrent);
                    }
                }
            }
        }
        other => panic!("expected siblings, got {:?}", other),
    }
}

// S6: a joining node converges after one gossip round with its seed
#[tokio::test]
async fn s6_join_converges_after_one_gossip_round() {
    let cluster = spawn_cluster(&["a", "b", "c"]);
    let transport = LocalTransport::of(&cluster);

    // d starts alone, pointed at a
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.directory = dir.path().to_path_buf();
    let state_d = MembershipState::bootstrap("d", &[], Q).unwrap();
    let (handle_d, _table_d, _ownership_d, _task_d) =
        MembershipService::spawn(state_d, &config).unwrap();
    transport.register("d", handle_d.clone());

    // the seed coordinator admits d, then d gossips with it
    cluster
        .node("a")
        .handle
        .join("d".to_string())
        .await
        .unwrap();
    let gossiper = Gossiper::new("d", handle_d.clone(), transport.clone());
    gossiper.round_with(&"a".to_string()).await.unwrap();

    let view_d = handle_d.snapshot().await.unwrap();
    let expected: Vec<NodeId> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
    assert_eq!(view_d.nodes(), expected.as_slice());
    for (owner, _) in view_d.partitions().entries() {
        assert!(view_d.nodes().contains(owner));
    }

    let view_a = cluster.node("a").handle.snapshot().await.unwrap();
    assert!(matches!(
        view_d.version().compare(view_a.version()),
        Causality::Equal | Causality::Greater
    ));

    // the newcomer now masters a share of the ring
    let masters = handle_d
        .partitions_for("d".to_string(), PartitionScope::Master)
        .await
        .unwrap();
    assert!(!masters.is_empty());
}

// quorum failure carries the full diagnostic
#[tokio::test]
async fn quorum_failure_lists_every_bad_replica() {
    let cluster = spawn_cluster(&["a", "b", "c"]);
    cluster.sim.kill("b");
    cluster.sim.kill("c");

    let err = cluster
        .node("a")
        .mediator
        .put("apple", &VectorClock::new(), b"v1".to_vec())
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("1 of 3"));
    assert!(message.contains("2 required"));
    assert!(message.contains("b: timeout"));
    assert!(message.contains("c: timeout"));
}

// a quorum of not_found beats a minority of values
#[tokio::test]
async fn get_missing_key_is_not_found_by_quorum() {
    let cluster = spawn_cluster(&["a", "b", "c"]);
    assert!(cluster
        .node("a")
        .mediator
        .get("apple")
        .await
        .unwrap()
        .is_none());
}

// delete respects the write quorum and the per-replica deadline path
#[tokio::test]
async fn delete_then_get_is_not_found() {
    let cluster = spawn_cluster(&["a", "b", "c"]);
    let mediator = &cluster.node("a").mediator;

    mediator
        .put("apple", &VectorClock::new(), b"v1".to_vec())
        .await
        .unwrap();
    assert_eq!(mediator.delete("apple").await.unwrap(), 3);
    assert!(mediator.get("apple").await.unwrap().is_none());
}

// a stale coordinator converges with the cluster by gossip, then serves
#[tokio::test]
async fn gossip_then_quorum_from_any_node() {
    let cluster = spawn_cluster(&["a", "b", "c"]);
    let transport = LocalTransport::of(&cluster);

    // pairwise rounds until every view agrees
    for (initiator, peer) in [("a", "b"), ("b", "c"), ("a", "c")] {
        let gossiper = Gossiper::new(
            initiator,
            cluster.node(initiator).handle.clone(),
            transport.clone(),
        );
        gossiper.round_with(&peer.to_string()).await.unwrap();
    }

    let view_a = cluster.node("a").handle.snapshot().await.unwrap();
    let view_c = cluster.node("c").handle.snapshot().await.unwrap();
    assert_eq!(
        view_a.version().compare(view_c.version()),
        Causality::Equal
    );

    cluster
        .node("c")
        .mediator
        .put("apple", &VectorClock::new(), b"from-c".to_vec())
        .await
        .unwrap();
    match cluster.node("b").mediator.get("apple").await.unwrap() {
        Some(Resolution::Single(vv)) => {
            assert_eq!(vv.value, b"from-c");
            assert_eq!(vv.clock, VectorClock::create("c"));
        }
        other => panic!("unexpected read result: {:?}", other),
    }
}

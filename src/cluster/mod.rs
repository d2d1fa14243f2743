//! Cluster coordination: vector clocks, partition map, membership, gossip

pub mod gossip;
pub mod membership;
pub mod partitions;
pub mod service;
pub mod vclock;

pub use gossip::{GossipControl, GossipTransport, Gossiper};
pub use membership::{MembershipState, PartitionScope};
pub use partitions::{partition_for_hash, replicas, reverse_replicas, PartitionMap};
pub use service::{
    MembershipHandle, MembershipService, OwnershipUpdate, RoutingSnapshot, RoutingTable,
};
pub use vclock::{reconcile, resolve, Causality, Resolution, VectorClock, VersionedValue};

//! # dynkv
//!
//! Coordination core of a Dynamo-style distributed key-value store:
//! - Cluster membership versioned by vector clocks, converged by gossip
//! - A stable partition map with churn-minimizing rebalancing
//! - Quorum reads and writes with read-side conflict resolution
//!
//! ## Architecture
//!
//! ```text
//!  client op            gossip tick
//!     │                     │
//!  ┌──▼───────┐      ┌──────▼─────┐     ┌────────────────┐
//!  │ Mediator │      │  Gossiper  │◄───►│ peer (network) │
//!  └──┬───┬───┘      └──────┬─────┘     └────────────────┘
//!     │   │ routing         │ merge/push
//!     │   │ snapshot  ┌─────▼──────────┐
//!     │   └──────────►│ MembershipState│──► <dir>/<node>.bin
//!     │               │    (actor)     │──► ownership watch
//!     │               └────────────────┘
//!     │ N-way fanout, quorum count
//!  ┌──▼──────────────────────────┐
//!  │ StorageEndpoint (partition, │
//!  │ node): external replicas    │
//!  └─────────────────────────────┘
//! ```
//!
//! The storage engine, network protocol, and process supervision are
//! external collaborators behind the [`common::StorageEndpoint`],
//! [`cluster::GossipTransport`], and [`common::ConfigPeer`] traits.

pub mod cluster;
pub mod common;
pub mod mediator;

// Re-export commonly used types
pub use cluster::{
    Gossiper, MembershipHandle, MembershipService, MembershipState, PartitionMap, PartitionScope,
    Resolution, VectorClock, VersionedValue,
};
pub use common::{Config, Error, NodeId, PartitionId, Result};
pub use mediator::Mediator;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

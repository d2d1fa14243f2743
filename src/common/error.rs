//! Error types for dynkv

use crate::common::storage::StorageError;
use crate::common::{NodeId, PartitionId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Persistence Errors ===
    #[error("corrupted membership file: {0}")]
    Corrupted(String),

    // === Routing Errors ===
    #[error("unknown partition: {0}")]
    UnknownPartition(PartitionId),

    #[error("node {0} is not a cluster member")]
    UnknownNode(NodeId),

    // === Quorum Errors ===
    #[error("{0}")]
    QuorumUnmet(QuorumDiagnostic),

    // === Cluster Invariant Errors ===
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    // === Bootstrap Errors ===
    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    // === Config Errors ===
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // === Actor Errors ===
    #[error("membership service unavailable")]
    ServiceClosed,

    // === Generic ===
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this an error the caller may reasonably retry?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::QuorumUnmet(_) | Error::PeerUnavailable(_) | Error::UnknownNode(_)
        )
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

/// Why a quorum operation failed: how many replicas answered well, how many
/// were required, and what every failing replica reported.
#[derive(Debug)]
pub struct QuorumDiagnostic {
    /// Operation name ("put", "get", "has_key", "delete")
    pub op: &'static str,
    /// Key the operation targeted
    pub key: String,
    /// Number of successful replies
    pub good: usize,
    /// Replies required for success (R or W)
    pub required: usize,
    /// Replica set size
    pub n: usize,
    /// Per-replica failures
    pub bad: Vec<(NodeId, StorageError)>,
}

impl std::fmt::Display for QuorumDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:?}: {} of {} replicas succeeded, {} required; failures: [",
            self.op, self.key, self.good, self.n, self.required
        )?;
        for (i, (node, err)) in self.bad.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", node, err)?;
        }
        write!(f, "]")
    }
}

//! Configuration for dynkv nodes
//!
//! A cluster splits config fields in two: the cluster invariants
//! (`n`, `r`, `w`, `q`, `storage_mod`, `blocksize`, `buffered_writes`)
//! must agree on every node, while the rest is local to the process.
//! At startup a joining node asks one visible peer for its config and
//! adopts the invariant fields, so the invariants spread automatically.

use crate::common::{Error, NodeId, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Deadline for the peer config fetch at bootstrap.
pub const CONFIG_PEER_TIMEOUT: Duration = Duration::from_millis(1000);

fn default_n() -> usize {
    3
}
fn default_r() -> usize {
    2
}
fn default_w() -> usize {
    2
}
fn default_q() -> u64 {
    8
}
fn default_directory() -> PathBuf {
    PathBuf::from("./data")
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawConfig")]
pub struct Config {
    /// Replication factor
    pub n: usize,

    /// Read quorum
    pub r: usize,

    /// Write quorum
    pub w: usize,

    /// Total partition count
    pub q: u64,

    /// Storage backend selector, resolved by the storage layer
    pub storage_mod: Option<String>,

    /// Storage block size hint (bytes)
    pub blocksize: Option<u64>,

    /// Whether the storage layer buffers writes
    pub buffered_writes: Option<bool>,

    /// Local data directory (membership file lives here)
    pub directory: PathBuf,
}

/// Raw parse target: every field optional so absent and `null` both map to
/// "unset", and unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    n: Option<usize>,
    #[serde(default)]
    r: Option<usize>,
    #[serde(default)]
    w: Option<usize>,
    #[serde(default)]
    q: Option<u64>,
    #[serde(default)]
    storage_mod: Option<String>,
    #[serde(default)]
    blocksize: Option<u64>,
    #[serde(default)]
    buffered_writes: Option<bool>,
    #[serde(default)]
    directory: Option<PathBuf>,
}

impl From<RawConfig> for Config {
    fn from(raw: RawConfig) -> Self {
        Self {
            n: raw.n.unwrap_or_else(default_n),
            r: raw.r.unwrap_or_else(default_r),
            w: raw.w.unwrap_or_else(default_w),
            q: raw.q.unwrap_or_else(default_q),
            storage_mod: raw.storage_mod,
            blocksize: raw.blocksize,
            buffered_writes: raw.buffered_writes,
            directory: raw.directory.unwrap_or_else(default_directory),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            n: default_n(),
            r: default_r(),
            w: default_w(),
            q: default_q(),
            storage_mod: None,
            blocksize: None,
            buffered_writes: None,
            directory: default_directory(),
        }
    }
}

impl Config {
    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate quorum invariants
    pub fn validate(&self) -> Result<()> {
        if self.n == 0 {
            return Err(Error::InvalidConfig("n must be at least 1".into()));
        }
        if self.r == 0 || self.r > self.n {
            return Err(Error::InvalidConfig(format!(
                "r must satisfy 1 <= r <= n (r={}, n={})",
                self.r, self.n
            )));
        }
        if self.w == 0 || self.w > self.n {
            return Err(Error::InvalidConfig(format!(
                "w must satisfy 1 <= w <= n (w={}, n={})",
                self.w, self.n
            )));
        }
        if self.q == 0 {
            return Err(Error::InvalidConfig("q must be at least 1".into()));
        }
        if self.r + self.w <= self.n {
            warn!(
                r = self.r,
                w = self.w,
                n = self.n,
                "r + w <= n: reads are not guaranteed to observe the latest write"
            );
        }
        Ok(())
    }

    /// Overwrite the cluster-invariant fields with a peer's values. Local
    /// fields (`directory`) are untouched.
    pub fn adopt_cluster_fields(&mut self, peer: &Config) {
        self.n = peer.n;
        self.r = peer.r;
        self.w = peer.w;
        self.q = peer.q;
        self.storage_mod = peer.storage_mod.clone();
        self.blocksize = peer.blocksize;
        self.buffered_writes = peer.buffered_writes;
    }
}

/// Remote config fetch, implemented by the network layer.
#[async_trait]
pub trait ConfigPeer: Send + Sync {
    async fn get_config(&self, peer: &NodeId) -> Result<Config>;
}

/// Reconcile a freshly loaded config with one randomly chosen visible peer.
///
/// On success the peer's cluster-invariant fields replace the local ones.
/// If no peer is visible or the call fails or times out, the local values
/// stand; a joining node without peers is its own authority.
pub async fn reconcile_with_peer(
    mut local: Config,
    peers: &[NodeId],
    client: &dyn ConfigPeer,
) -> Config {
    if peers.is_empty() {
        return local;
    }

    let peer = {
        let mut rng = rand::thread_rng();
        peers[rng.gen_range(0..peers.len())].clone()
    };

    match tokio::time::timeout(CONFIG_PEER_TIMEOUT, client.get_config(&peer)).await {
        Ok(Ok(remote)) => {
            info!(peer = %peer, "adopted cluster config from peer");
            local.adopt_cluster_fields(&remote);
        }
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "peer config fetch failed, keeping local values");
        }
        Err(_) => {
            warn!(peer = %peer, "peer config fetch timed out, keeping local values");
        }
    }

    local
}

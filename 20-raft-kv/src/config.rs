//! Node configuration.
//!
//! [`NodeConfig`] is the identity a node advertises: it is persisted under
//! `member_<id>` and, while the node leads, under `CurrentLeader`, where other
//! nodes read `serverAddress` to forward writes. [`NodeOptions`] holds the
//! local tuning knobs that never leave the process. Both are produced from
//! [`Settings`], the command line / environment surface of the binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// HTTP address other nodes use to reach this node's API.
    pub server_address: String,
    #[serde(default)]
    pub join_address: Option<String>,
    pub raft_node_id: u64,
    /// Address of the raft peer listener.
    pub raft_address: String,
    pub volume_dir: PathBuf,
    #[serde(default)]
    pub peers: Vec<String>,
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.raft_node_id == 0 {
            return Err(Error::InvalidInput("raft node id must be non-zero".into()));
        }
        if self.server_address.trim().is_empty() {
            return Err(Error::InvalidInput("server address is empty".into()));
        }
        if self.raft_address.trim().is_empty() {
            return Err(Error::InvalidInput("raft address is empty".into()));
        }
        Ok(())
    }

    /// Seed HTTP addresses to join through, join address first, without duplicates.
    pub fn seeds(&self) -> Vec<String> {
        let mut seeds: Vec<String> = Vec::new();
        let candidates = self.join_address.iter().chain(self.peers.iter());
        for seed in candidates.map(|s| s.trim()).filter(|s| !s.is_empty()) {
            if !seeds.iter().any(|known| known == seed) {
                seeds.push(seed.to_string());
            }
        }
        seeds
    }

    /// A node without seeds forms a new single-member cluster.
    pub fn bootstraps(&self) -> bool {
        self.seeds().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Bound on waiting for a local proposal to be committed and applied.
    pub apply_timeout: Duration,
    /// Bound on a forwarded request to the leader.
    pub forward_timeout: Duration,
    /// Fixed backoff between join attempts and member registration retries.
    pub join_interval: Duration,
    /// `None` retries forever.
    pub max_join_attempts: Option<u32>,
    /// Applied entries between log compactions.
    pub snapshot_threshold: u64,
    /// Leave the voting configuration before stopping.
    pub leave_on_shutdown: bool,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            apply_timeout: Duration::from_millis(500),
            forward_timeout: Duration::from_secs(5),
            join_interval: Duration::from_secs(2),
            max_join_attempts: None,
            snapshot_threshold: 1024,
            leave_on_shutdown: false,
        }
    }
}

/// Replicated key-value node.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Settings {
    /// HTTP listen address, advertised to peers for forwarding.
    #[arg(long, env = "SERVER_ADDRESS", default_value = "127.0.0.1:8080")]
    pub server_address: String,

    /// HTTP address of an existing member to join through.
    #[arg(long, env = "SERVER_JOIN_ADDRESS")]
    pub join_address: Option<String>,

    /// Unique non-zero raft node id.
    #[arg(long, env = "RAFT_NODE_ID")]
    pub raft_node_id: u64,

    /// Address the raft peer listener binds to.
    #[arg(long, env = "RAFT_ADDRESS", default_value = "127.0.0.1:7000")]
    pub raft_address: String,

    /// Directory holding the node's durable store.
    #[arg(long, env = "RAFT_VOL_DIR", default_value = "./data")]
    pub volume_dir: PathBuf,

    /// Additional seed HTTP addresses, comma separated.
    #[arg(long, env = "RAFT_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    #[arg(long, env = "APPLY_TIMEOUT_MS", default_value_t = 500)]
    pub apply_timeout_ms: u64,

    #[arg(long, env = "FORWARD_TIMEOUT_MS", default_value_t = 5000)]
    pub forward_timeout_ms: u64,

    #[arg(long, env = "JOIN_INTERVAL_MS", default_value_t = 2000)]
    pub join_interval_ms: u64,

    /// Give up joining after this many attempts (default: retry forever).
    #[arg(long, env = "JOIN_MAX_ATTEMPTS")]
    pub max_join_attempts: Option<u32>,

    #[arg(long, env = "SNAPSHOT_THRESHOLD", default_value_t = 1024)]
    pub snapshot_threshold: u64,

    /// Remove this node from the voting configuration when it shuts down.
    #[arg(long, env = "LEAVE_ON_SHUTDOWN")]
    pub leave_on_shutdown: bool,
}

impl Settings {
    pub fn split(self) -> (NodeConfig, NodeOptions) {
        let config = NodeConfig {
            server_address: self.server_address,
            join_address: self.join_address.filter(|addr| !addr.trim().is_empty()),
            raft_node_id: self.raft_node_id,
            raft_address: self.raft_address,
            volume_dir: self.volume_dir,
            peers: self.peers,
        };
        let options = NodeOptions {
            apply_timeout: Duration::from_millis(self.apply_timeout_ms),
            forward_timeout: Duration::from_millis(self.forward_timeout_ms),
            join_interval: Duration::from_millis(self.join_interval_ms),
            max_join_attempts: self.max_join_attempts,
            snapshot_threshold: self.snapshot_threshold.max(1),
            leave_on_shutdown: self.leave_on_shutdown,
        };
        (config, options)
    }
}

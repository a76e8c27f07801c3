pub type NodeId = String;
pub type Term = u64;
pub type LogIndex = u64;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
    pub node_id: NodeId,
}

impl NodeAddress {
    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Static cluster membership and timing, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeAddress>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Lower bound of the randomized election timeout.
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_propose_timeout_ms")]
    pub propose_timeout_ms: u64,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_heartbeat_interval_ms() -> u64 {
    50
}

fn default_election_timeout_ms() -> u64 {
    default_heartbeat_interval_ms() * 30
}

fn default_rpc_timeout_ms() -> u64 {
    500
}

fn default_propose_timeout_ms() -> u64 {
    5_000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ClusterConfig {
    /// Builds a config with default timing around the given nodes.
    pub fn new(nodes: Vec<NodeAddress>) -> Self {
        Self {
            nodes,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            election_timeout_ms: default_election_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            propose_timeout_ms: default_propose_timeout_ms(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.node_id.clone()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.node_id == id)
    }

    pub fn address_of(&self, id: &str) -> Option<&NodeAddress> {
        self.nodes.iter().find(|n| n.node_id == id)
    }

    /// Every member except `id`.
    pub fn peers_of(&self, id: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.node_id != id)
            .map(|n| n.node_id.clone())
            .collect()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    /// Directory holding the persistent state of `id`.
    pub fn node_data_dir(&self, id: &str) -> PathBuf {
        self.data_dir.join(id)
    }
}

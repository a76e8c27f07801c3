use nidus_common::types::ClusterConfig;
use rand::Rng;
use std::time::Duration;

/// Timing for one node's event loop.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub heartbeat_interval: Duration,
    /// Lower bound; each election timeout is drawn from `[base, 2 * base)`.
    pub election_timeout: Duration,
    /// Round-trip bound for a single RPC.
    pub rpc_timeout: Duration,
    /// How long `propose` waits for commit + apply.
    pub propose_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout: Duration::from_millis(1500),
            rpc_timeout: Duration::from_millis(500),
            propose_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&ClusterConfig> for RaftConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            election_timeout: config.election_timeout(),
            rpc_timeout: config.rpc_timeout(),
            propose_timeout: config.propose_timeout(),
        }
    }
}

impl RaftConfig {
    /// A fresh randomized election timeout.
    pub fn random_election_timeout(&self) -> Duration {
        let base = self.election_timeout.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..base.max(1));
        Duration::from_millis(base + jitter)
    }
}

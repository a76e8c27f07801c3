use crate::error::{NidusError, Result};
use crate::types::ClusterConfig;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Loads a cluster configuration from a JSON file.
pub fn load_config(path: impl AsRef<Path>) -> Result<ClusterConfig> {
    let data = fs::read_to_string(path)?;
    let config: ClusterConfig = serde_json::from_str(&data)?;
    validate(&config)?;
    Ok(config)
}

/// Rejects configurations the consensus core cannot run on.
pub fn validate(config: &ClusterConfig) -> Result<()> {
    if config.nodes.is_empty() {
        return Err(NidusError::Config("cluster has no nodes".into()));
    }

    let mut ids = HashSet::new();
    let mut addrs = HashSet::new();
    for node in &config.nodes {
        if node.node_id.is_empty() {
            return Err(NidusError::Config("node id must not be empty".into()));
        }
        if !ids.insert(node.node_id.as_str()) {
            return Err(NidusError::Config(format!(
                "duplicate node id {}",
                node.node_id
            )));
        }
        if !addrs.insert(node.socket_addr()) {
            return Err(NidusError::Config(format!(
                "duplicate address {}",
                node.socket_addr()
            )));
        }
    }

    if config.heartbeat_interval_ms == 0 {
        return Err(NidusError::Config(
            "heartbeat interval must be positive".into(),
        ));
    }
    if config.heartbeat_interval_ms >= config.election_timeout_ms {
        return Err(NidusError::Config(format!(
            "heartbeat interval ({}ms) must be shorter than the election timeout ({}ms)",
            config.heartbeat_interval_ms, config.election_timeout_ms
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_valid_config() {
        let file = write_config(
            r#"{
                "nodes": [
                    {"node_id": "node-0", "host": "127.0.0.1", "port": 12000},
                    {"node_id": "node-1", "host": "127.0.0.1", "port": 12001},
                    {"node_id": "node-2", "host": "127.0.0.1", "port": 12002}
                ],
                "heartbeat_interval_ms": 20,
                "data_dir": "/tmp/nidus"
            }"#,
        );

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.heartbeat_interval_ms, 20);
        assert_eq!(config.election_timeout_ms, 1500);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_config("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, NidusError::Io(_)));
    }

    #[test]
    fn test_malformed_json_is_serde_error() {
        let file = write_config("{ nodes: ");
        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, NidusError::Serde(_)));
    }

    #[test]
    fn test_rejects_empty_and_duplicate_nodes() {
        let empty = write_config(r#"{"nodes": []}"#);
        assert!(matches!(
            load_config(empty.path()).unwrap_err(),
            NidusError::Config(_)
        ));

        let dup = write_config(
            r#"{"nodes": [
                {"node_id": "a", "host": "h", "port": 1},
                {"node_id": "a", "host": "h", "port": 2}
            ]}"#,
        );
        assert!(matches!(
            load_config(dup.path()).unwrap_err(),
            NidusError::Config(_)
        ));

        let same_addr = write_config(
            r#"{"nodes": [
                {"node_id": "a", "host": "h", "port": 1},
                {"node_id": "b", "host": "h", "port": 1}
            ]}"#,
        );
        assert!(matches!(
            load_config(same_addr.path()).unwrap_err(),
            NidusError::Config(_)
        ));
    }

    #[test]
    fn test_rejects_heartbeat_not_below_election_timeout() {
        let file = write_config(
            r#"{
                "nodes": [{"node_id": "a", "host": "h", "port": 1}],
                "heartbeat_interval_ms": 100,
                "election_timeout_ms": 100
            }"#,
        );
        assert!(matches!(
            load_config(file.path()).unwrap_err(),
            NidusError::Config(_)
        ));
    }
}

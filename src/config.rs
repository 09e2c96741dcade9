//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Configuration of one node: identity, peers, and protocol timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier, also the prefix of locally minted transaction ids.
    pub node_id: NodeId,

    /// Ordered peer base URLs (e.g. `http://127.0.0.1:8002`).
    #[serde(default)]
    pub peers: Vec<String>,

    /// Event log file. `None` disables the log.
    #[serde(default)]
    pub wal_path: Option<PathBuf>,

    /// Per-peer timeout for prepare and decision calls.
    #[serde(default = "default_prepare_timeout_ms")]
    pub prepare_timeout_ms: u64,

    /// How long a staged key may wait for a decision before a participant
    /// aborts it unilaterally.
    #[serde(default = "default_staging_lease_ms")]
    pub staging_lease_ms: u64,
}

fn default_prepare_timeout_ms() -> u64 {
    3_000
}

fn default_staging_lease_ms() -> u64 {
    30_000
}

impl NodeConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            peers: Vec::new(),
            wal_path: None,
            prepare_timeout_ms: default_prepare_timeout_ms(),
            staging_lease_ms: default_staging_lease_ms(),
        }
    }

    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_wal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.wal_path = Some(path.into());
        self
    }

    pub fn with_prepare_timeout(mut self, timeout: Duration) -> Self {
        self.prepare_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_staging_lease(mut self, lease: Duration) -> Self {
        self.staging_lease_ms = lease.as_millis() as u64;
        self
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn staging_lease(&self) -> Duration {
        Duration::from_millis(self.staging_lease_ms)
    }

    /// `./wal_<node>.log`
    pub fn default_wal_path(node_id: &str) -> PathBuf {
        PathBuf::from(format!("./wal_{node_id}.log"))
    }
}

/// Split a comma-separated peer list, dropping blanks and trailing slashes.
pub fn parse_peers(peers: &str) -> Vec<String> {
    peers
        .split(',')
        .map(|p| p.trim().trim_end_matches('/'))
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_are_trimmed_and_blanks_dropped() {
        let peers = parse_peers(" http://a:1/ ,,http://b:2 , ");
        assert_eq!(peers, vec!["http://a:1", "http://b:2"]);
        assert!(parse_peers("").is_empty());
    }

    #[test]
    fn defaults_apply_when_fields_missing() {
        let config: NodeConfig = serde_json::from_str(r#"{"node_id":"n1"}"#).unwrap();
        assert_eq!(config.node_id, "n1");
        assert!(config.peers.is_empty());
        assert!(config.wal_path.is_none());
        assert_eq!(config.prepare_timeout(), Duration::from_secs(3));
        assert_eq!(config.staging_lease(), Duration::from_secs(30));
    }
}

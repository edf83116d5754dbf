//! Configuration for a PlumeDB cluster node.

use serde::{Deserialize, Serialize};

/// Configuration for one node of the cluster core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Unique identifier for this node.
    pub node_id: String,
    /// Shard this node serves documents for.
    pub shard_id: String,
    /// Consensus peers (node ids) forming the cluster with this node.
    pub peers: Vec<String>,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Lower bound of the randomized election timeout (ms).
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout (ms).
    pub election_timeout_max_ms: u64,
    /// Consensus proposal timeout (ms); callers re-check leadership on expiry.
    pub propose_timeout_ms: u64,
    /// Maximum documents per replication batch.
    pub replication_batch_size: usize,
    /// Migration copy rate limit (bytes/sec).
    pub migration_rate_limit: u64,
    /// Committed entries between raft log compactions.
    pub snapshot_interval: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", fastrand::u64(..)),
            shard_id: "shard-1".to_string(),
            peers: Vec::new(),
            heartbeat_interval_ms: 100,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            propose_timeout_ms: 10_000,
            replication_batch_size: 128,
            migration_rate_limit: 50 * 1024 * 1024, // 50 MB/s
            snapshot_interval: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ClusterConfig::default();
        assert_eq!(cfg.heartbeat_interval_ms, 100);
        assert!(cfg.election_timeout_min_ms < cfg.election_timeout_max_ms);
        assert_eq!(cfg.replication_batch_size, 128);
    }

    #[test]
    fn test_config_serialization() {
        let cfg = ClusterConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let decoded: ClusterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.node_id, cfg.node_id);
        assert_eq!(decoded.migration_rate_limit, cfg.migration_rate_limit);
    }
}

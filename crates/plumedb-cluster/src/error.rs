//! Cluster error taxonomy.
//!
//! Every consensus-level error here is locally recoverable by retry or
//! catch-up. The one exception is [`ClusterError::Storage`]: corruption of
//! the durable log must halt the node rather than risk divergent state.
//! A partitioned minority has no error of its own — it is observable only
//! as proposals that never commit.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// Propose attempted on a non-leader; retry against the current leader.
    #[error("not leader (current term {term})")]
    NotLeader { term: u64 },
    /// Append carried a stale term and was rejected.
    #[error("term {got} too old (current term {current})")]
    TermTooOld { got: u64, current: u64 },
    /// Append did not match the local log; follower truncates and catches up.
    #[error("log mismatch at index {index}")]
    LogMismatch { index: u64 },
    #[error("bucket {0} already has an active migration")]
    MigrationAlreadyActive(u32),
    /// Replayed completion of a finished migration; a logical no-op.
    #[error("migration for bucket {0} already complete")]
    MigrationAlreadyComplete(u32),
    #[error("no migration for bucket {0}")]
    MigrationNotFound(u32),
    /// Phase transition attempted out of order (e.g. completion before
    /// confirmation).
    #[error("migration for bucket {bucket} in wrong phase: {detail}")]
    MigrationPhase { bucket: u32, detail: String },
    /// Replication message for a bucket this node does not own; dropped.
    #[error("bucket {bucket} not owned by shard {shard}")]
    BucketNotOwned { bucket: u32, shard: String },
    #[error("invalid topology: {0}")]
    InvalidTopology(String),
    #[error("shard not found: {0}")]
    ShardNotFound(String),
    #[error("proposal timed out after {0} ms")]
    Timeout(u64),
    /// Durable log corruption — globally fatal, the node must halt.
    #[error("raft storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Core(#[from] plumedb_core::PlumeError),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

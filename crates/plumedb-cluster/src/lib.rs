pub mod config;
pub mod consensus;
pub mod error;
pub mod migration;
pub mod node;
pub mod replication;
pub mod topology;

pub use crate::config::ClusterConfig;
pub use crate::consensus::raft::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry, RaftNode, RaftState, VoteRequest,
    VoteResponse,
};
pub use crate::consensus::storage::{FileRaftStorage, MemoryRaftStorage, RaftStorage};
pub use crate::error::{ClusterError, Result};
pub use crate::migration::{CopyBatch, MigrationCoordinator, TransferThrottle};
pub use crate::node::{ClusterNode, ClusterStatus};
pub use crate::replication::{
    ConflictStrategy, DocumentAdvertisement, LastWriteWins, ReplicationEngine, ReplicationStats,
};
pub use crate::topology::{
    ApplyOutcome, BucketMigration, BucketRange, ClusterStateMachine, Command, MigrationStatus,
    ShardTopology, StateSnapshot, TopologySnapshot,
};

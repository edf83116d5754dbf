//! Consensus log: leader-based replication of topology commands.

pub mod raft;
pub mod storage;

pub use raft::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry, RaftNode, RaftState, VoteRequest,
    VoteResponse,
};
pub use storage::{FileRaftStorage, MemoryRaftStorage, PersistentState, RaftStorage};

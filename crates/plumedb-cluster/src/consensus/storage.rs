//! Durable raft state.
//!
//! Persisted per node: current term, voted-for, log entries, and the latest
//! compaction snapshot. A load failure means the durable log is corrupt and
//! the node must halt rather than risk divergent state — the storage error
//! is the only globally fatal error in this core.

use std::fs;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::consensus::raft::LogEntry;
use crate::error::{ClusterError, Result};
use crate::topology::StateSnapshot;

/// Everything a node must recover after restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub entries: Vec<LogEntry>,
    pub snapshot: Option<StateSnapshot>,
}

/// Durable store for raft hard state and log entries.
pub trait RaftStorage: Send {
    fn load(&self) -> Result<PersistentState>;
    fn save_hard_state(&self, term: u64, voted_for: Option<&str>) -> Result<()>;
    /// Append entries to the durable log tail.
    fn append_entries(&self, entries: &[LogEntry]) -> Result<()>;
    /// Remove all entries with index >= `from` (divergent-leader recovery).
    fn truncate_from(&self, from: u64) -> Result<()>;
    /// Replace the log prefix up to the snapshot's last included index.
    fn compact_to(&self, snapshot: &StateSnapshot) -> Result<()>;
}

/// Volatile storage for tests and single-process clusters.
#[derive(Default)]
pub struct MemoryRaftStorage {
    state: Mutex<PersistentState>,
}

impl MemoryRaftStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RaftStorage for MemoryRaftStorage {
    fn load(&self) -> Result<PersistentState> {
        Ok(self.state.lock().clone())
    }

    fn save_hard_state(&self, term: u64, voted_for: Option<&str>) -> Result<()> {
        let mut state = self.state.lock();
        state.current_term = term;
        state.voted_for = voted_for.map(|s| s.to_string());
        Ok(())
    }

    fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        self.state.lock().entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&self, from: u64) -> Result<()> {
        self.state.lock().entries.retain(|e| e.index < from);
        Ok(())
    }

    fn compact_to(&self, snapshot: &StateSnapshot) -> Result<()> {
        let mut state = self.state.lock();
        state
            .entries
            .retain(|e| e.index > snapshot.last_included_index);
        state.snapshot = Some(snapshot.clone());
        Ok(())
    }
}

/// File-backed storage: the whole persistent state as one JSON document,
/// rewritten through a temp file and atomic rename on every mutation.
pub struct FileRaftStorage {
    path: PathBuf,
    state: Mutex<PersistentState>,
}

impl FileRaftStorage {
    /// Open or create the state file. A present-but-unreadable file is
    /// corruption: the caller must halt the node.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let bytes = fs::read(&path)
                .map_err(|e| ClusterError::Storage(format!("read {}: {e}", path.display())))?;
            serde_json::from_slice(&bytes).map_err(|e| {
                ClusterError::Storage(format!("corrupt raft state {}: {e}", path.display()))
            })?
        } else {
            PersistentState::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn flush(&self, state: &PersistentState) -> Result<()> {
        let bytes = serde_json::to_vec(state)
            .map_err(|e| ClusterError::Storage(format!("encode raft state: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)
            .map_err(|e| ClusterError::Storage(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| ClusterError::Storage(format!("rename {}: {e}", self.path.display())))?;
        Ok(())
    }
}

impl RaftStorage for FileRaftStorage {
    fn load(&self) -> Result<PersistentState> {
        Ok(self.state.lock().clone())
    }

    fn save_hard_state(&self, term: u64, voted_for: Option<&str>) -> Result<()> {
        let mut state = self.state.lock();
        state.current_term = term;
        state.voted_for = voted_for.map(|s| s.to_string());
        self.flush(&state)
    }

    fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        let mut state = self.state.lock();
        state.entries.extend_from_slice(entries);
        self.flush(&state)
    }

    fn truncate_from(&self, from: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.entries.retain(|e| e.index < from);
        self.flush(&state)
    }

    fn compact_to(&self, snapshot: &StateSnapshot) -> Result<()> {
        let mut state = self.state.lock();
        state
            .entries
            .retain(|e| e.index > snapshot.last_included_index);
        state.snapshot = Some(snapshot.clone());
        self.flush(&state)
    }
}

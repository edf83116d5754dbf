//! Replicated consensus log — leader election and command replication.
//!
//! Single-writer-per-term: only the current leader proposes, and a leader
//! commits an index only once a majority has durably appended an entry of
//! the leader's own term covering it. Prior-term entries commit indirectly
//! through that rule, never directly. Followers truncate and overwrite on
//! divergence; any message with a larger term forces an immediate step-down.
//!
//! Hard state (term, vote, log) goes through [`RaftStorage`] before it is
//! acted on, so a restarted node recovers exactly where it left off.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::ClusterConfig;
use crate::consensus::storage::RaftStorage;
use crate::error::{ClusterError, Result};
use crate::topology::{Command, StateSnapshot};

/// Raft consensus state for a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftState {
    Follower,
    Candidate,
    Leader,
}

/// A committed or in-flight entry of the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
}

/// Vote request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Vote response message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Append entries request (heartbeat and log replication).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// Append entries response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
}

/// A raft node: manages consensus state for one node of the cluster.
pub struct RaftNode {
    pub node_id: String,
    state: RaftState,
    current_term: u64,
    voted_for: Option<String>,
    /// Entries after the snapshot point; entry with global index `i` lives
    /// at `log[i - snapshot_index - 1]`.
    log: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
    commit_index: u64,
    last_applied: u64,
    // Leader state
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    // Cluster membership
    peers: Vec<String>,
    // Election state
    votes_received: usize,
    election_timeout_min_ms: u64,
    election_timeout_max_ms: u64,
    election_timeout_ms: u64,
    last_heartbeat_ms: u64,
    storage: Box<dyn RaftStorage>,
}

impl RaftNode {
    /// Recover a node from durable storage. A corrupt store fails here and
    /// the caller must halt instead of running with divergent state.
    pub fn new(
        node_id: &str,
        peers: Vec<String>,
        config: &ClusterConfig,
        storage: Box<dyn RaftStorage>,
    ) -> Result<Self> {
        let persisted = storage.load()?;
        let (snapshot_index, snapshot_term) = persisted
            .snapshot
            .as_ref()
            .map(|s| (s.last_included_index, s.last_included_term))
            .unwrap_or((0, 0));

        let mut node = Self {
            node_id: node_id.to_string(),
            state: RaftState::Follower,
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            log: persisted.entries,
            snapshot_index,
            snapshot_term,
            commit_index: snapshot_index,
            last_applied: snapshot_index,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            peers,
            votes_received: 0,
            election_timeout_min_ms: config.election_timeout_min_ms,
            election_timeout_max_ms: config.election_timeout_max_ms,
            election_timeout_ms: 0,
            last_heartbeat_ms: current_timestamp_ms(),
            storage,
        };
        node.reset_election_timeout();
        Ok(node)
    }

    pub fn state(&self) -> RaftState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state == RaftState::Leader
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_log_index(&self) -> u64 {
        self.snapshot_index + self.log.len() as u64
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        if index < self.snapshot_index {
            return None; // compacted away
        }
        self.log
            .get((index - self.snapshot_index - 1) as usize)
            .map(|e| e.term)
    }

    fn persist_hard_state(&self) -> Result<()> {
        self.storage
            .save_hard_state(self.current_term, self.voted_for.as_deref())
    }

    /// Remove local entries with index >= `from`, durably.
    fn truncate_local(&mut self, from: u64) -> Result<()> {
        self.storage.truncate_from(from)?;
        let keep = from.saturating_sub(self.snapshot_index + 1) as usize;
        self.log.truncate(keep);
        Ok(())
    }

    fn step_down(&mut self, term: u64) -> Result<()> {
        if self.state != RaftState::Follower {
            tracing::info!(node = %self.node_id, term, "stepping down to follower");
        }
        self.current_term = term;
        self.state = RaftState::Follower;
        self.voted_for = None;
        self.persist_hard_state()
    }

    fn reset_election_timeout(&mut self) {
        let spread = self
            .election_timeout_max_ms
            .saturating_sub(self.election_timeout_min_ms);
        self.election_timeout_ms = self.election_timeout_min_ms + fastrand::u64(..=spread);
    }

    /// Start an election: transition to Candidate and vote for self.
    pub fn start_election(&mut self) -> Result<VoteRequest> {
        self.state = RaftState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.node_id.clone());
        self.votes_received = 1;
        self.persist_hard_state()?;
        self.reset_election_timeout();
        self.last_heartbeat_ms = current_timestamp_ms();

        // In a single-node cluster the self-vote is already a majority.
        let majority = (self.peers.len() + 1) / 2 + 1;
        if self.votes_received >= majority {
            self.become_leader()?;
        }

        Ok(VoteRequest {
            term: self.current_term,
            candidate_id: self.node_id.clone(),
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        })
    }

    /// Handle a vote request from a candidate.
    pub fn handle_vote_request(&mut self, req: &VoteRequest) -> Result<VoteResponse> {
        if req.term > self.current_term {
            self.step_down(req.term)?;
        }

        let vote_granted = if req.term < self.current_term
            || (self.voted_for.is_some() && self.voted_for.as_deref() != Some(&req.candidate_id))
        {
            false
        } else {
            // Grant only to candidates whose log is at least as up-to-date.
            let my_last_index = self.last_log_index();
            let my_last_term = self.last_log_term();
            if req.last_log_term > my_last_term
                || (req.last_log_term == my_last_term && req.last_log_index >= my_last_index)
            {
                self.voted_for = Some(req.candidate_id.clone());
                self.persist_hard_state()?;
                self.last_heartbeat_ms = current_timestamp_ms();
                true
            } else {
                false
            }
        };

        Ok(VoteResponse {
            term: self.current_term,
            vote_granted,
        })
    }

    /// Handle a vote response; becomes leader on strict majority.
    pub fn handle_vote_response(&mut self, resp: &VoteResponse) -> Result<()> {
        if resp.term > self.current_term {
            return self.step_down(resp.term);
        }
        if self.state != RaftState::Candidate {
            return Ok(());
        }
        if resp.vote_granted {
            self.votes_received += 1;
            let total_nodes = self.peers.len() + 1;
            let majority = total_nodes / 2 + 1;
            if self.votes_received >= majority {
                self.become_leader()?;
            }
        }
        Ok(())
    }

    fn become_leader(&mut self) -> Result<()> {
        self.state = RaftState::Leader;
        let next = self.last_log_index() + 1;
        for peer in &self.peers {
            self.next_index.insert(peer.clone(), next);
            self.match_index.insert(peer.clone(), 0);
        }
        tracing::info!(node = %self.node_id, term = self.current_term, "became leader");

        // No-op barrier entry: committing it indirectly commits everything
        // from prior terms still pending in the log.
        let entry = LogEntry {
            index: self.last_log_index() + 1,
            term: self.current_term,
            command: Command::Noop,
        };
        self.storage.append_entries(std::slice::from_ref(&entry))?;
        self.log.push(entry);
        self.advance_commit_index();
        Ok(())
    }

    /// Propose a command for replication. Leader-only; the returned index is
    /// where the entry will commit if this leadership survives.
    pub fn propose(&mut self, command: Command) -> Result<u64> {
        if self.state != RaftState::Leader {
            return Err(ClusterError::NotLeader {
                term: self.current_term,
            });
        }
        let entry = LogEntry {
            index: self.last_log_index() + 1,
            term: self.current_term,
            command,
        };
        let index = entry.index;
        self.storage.append_entries(std::slice::from_ref(&entry))?;
        self.log.push(entry);
        self.advance_commit_index();
        Ok(index)
    }

    /// Handle append entries from a leader.
    pub fn handle_append_entries(
        &mut self,
        req: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if req.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: 0,
            });
        }
        if req.term > self.current_term {
            self.step_down(req.term)?;
        }
        self.state = RaftState::Follower;
        self.last_heartbeat_ms = current_timestamp_ms();

        // Log consistency check at the leader's previous index.
        if req.prev_log_index > self.last_log_index() {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: self.last_log_index(),
            });
        }
        if req.prev_log_index > self.snapshot_index {
            match self.term_at(req.prev_log_index) {
                Some(term) if term == req.prev_log_term => {}
                _ => {
                    // Divergence: truncate from the mismatch and report back.
                    self.truncate_local(req.prev_log_index)?;
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        match_index: self.last_log_index(),
                    });
                }
            }
        }

        // Append, overwriting any conflicting suffix.
        let mut to_append = Vec::new();
        for entry in &req.entries {
            if entry.index <= self.snapshot_index {
                continue; // already covered by the snapshot
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_local(entry.index)?;
                    to_append.push(entry.clone());
                }
                None => to_append.push(entry.clone()),
            }
        }
        if !to_append.is_empty() {
            self.storage.append_entries(&to_append)?;
            self.log.extend(to_append);
        }

        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(self.last_log_index());
        }

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: self.last_log_index(),
        })
    }

    /// Build the next append request for a follower. Returns None if this
    /// node is not the leader or the follower needs a snapshot instead.
    pub fn create_append_entries(&self, peer_id: &str) -> Option<AppendEntriesRequest> {
        if self.state != RaftState::Leader {
            return None;
        }
        let next_idx = self
            .next_index
            .get(peer_id)
            .copied()
            .unwrap_or(self.last_log_index() + 1);
        if next_idx <= self.snapshot_index {
            return None; // compacted past this follower; send a snapshot
        }
        let prev_log_index = next_idx - 1;
        let prev_log_term = self.term_at(prev_log_index)?;

        let offset = (next_idx - self.snapshot_index - 1) as usize;
        let entries: Vec<LogEntry> = self.log.iter().skip(offset).cloned().collect();

        Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.node_id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        })
    }

    /// True when a follower has fallen behind the compacted prefix.
    pub fn follower_needs_snapshot(&self, peer_id: &str) -> bool {
        self.state == RaftState::Leader
            && self
                .next_index
                .get(peer_id)
                .is_some_and(|&next| next <= self.snapshot_index)
    }

    /// Handle an append response from a follower (leader side).
    pub fn handle_append_entries_response(
        &mut self,
        peer_id: &str,
        resp: &AppendEntriesResponse,
    ) -> Result<()> {
        if resp.term > self.current_term {
            return self.step_down(resp.term);
        }
        if self.state != RaftState::Leader {
            return Ok(());
        }

        if resp.success {
            self.next_index
                .insert(peer_id.to_string(), resp.match_index + 1);
            self.match_index
                .insert(peer_id.to_string(), resp.match_index);
            self.advance_commit_index();
        } else {
            // Back off toward the follower's actual log end.
            let next = self.next_index.get(peer_id).copied().unwrap_or(1);
            let backed_off = (resp.match_index + 1).min(next.saturating_sub(1)).max(1);
            self.next_index.insert(peer_id.to_string(), backed_off);
        }
        Ok(())
    }

    /// Advance the commit index by majority match. Restricted to entries of
    /// the current term: prior-term entries are only committed indirectly.
    fn advance_commit_index(&mut self) {
        for n in (self.commit_index + 1)..=self.last_log_index() {
            if self.term_at(n) != Some(self.current_term) {
                continue;
            }
            let mut match_count = 1; // leader itself
            for &mi in self.match_index.values() {
                if mi >= n {
                    match_count += 1;
                }
            }
            let total_nodes = self.peers.len() + 1;
            let majority = total_nodes / 2 + 1;
            if match_count >= majority {
                self.commit_index = n;
            }
        }
    }

    /// Check if the randomized election timeout has elapsed.
    pub fn election_timeout_elapsed(&self) -> bool {
        let now = current_timestamp_ms();
        now.saturating_sub(self.last_heartbeat_ms) >= self.election_timeout_ms
    }

    /// Committed entries not yet delivered to the state machine, in index
    /// order. Delivery order is the state machine's serialization guarantee.
    pub fn entries_to_apply(&self) -> Vec<LogEntry> {
        if self.last_applied >= self.commit_index {
            return Vec::new();
        }
        let start = (self.last_applied - self.snapshot_index) as usize;
        let end = (self.commit_index - self.snapshot_index) as usize;
        self.log[start..end].to_vec()
    }

    /// Mark entries as delivered to the state machine.
    pub fn mark_applied(&mut self, up_to: u64) {
        if up_to > self.last_applied {
            self.last_applied = up_to;
        }
    }

    /// Compact the committed log prefix into a state-machine snapshot.
    pub fn compact_log(&mut self, snapshot: &StateSnapshot) -> Result<()> {
        let idx = snapshot.last_included_index;
        if idx <= self.snapshot_index {
            return Ok(());
        }
        if idx > self.commit_index {
            return Err(ClusterError::LogMismatch { index: idx });
        }
        self.storage.compact_to(snapshot)?;
        let drop = (idx - self.snapshot_index) as usize;
        self.log.drain(..drop);
        self.snapshot_index = idx;
        self.snapshot_term = snapshot.last_included_term;
        Ok(())
    }

    /// Install a leader-provided snapshot on a lagging follower. Returns
    /// true if installed; the caller must restore its state machine from it.
    pub fn install_snapshot(&mut self, term: u64, snapshot: &StateSnapshot) -> Result<bool> {
        if term < self.current_term {
            return Err(ClusterError::TermTooOld {
                got: term,
                current: self.current_term,
            });
        }
        if term > self.current_term {
            self.step_down(term)?;
        }
        self.state = RaftState::Follower;
        self.last_heartbeat_ms = current_timestamp_ms();

        if snapshot.last_included_index <= self.snapshot_index {
            return Ok(false);
        }

        // The snapshot supersedes the entire local log.
        self.storage.truncate_from(0)?;
        self.storage.compact_to(snapshot)?;
        self.log.clear();
        self.snapshot_index = snapshot.last_included_index;
        self.snapshot_term = snapshot.last_included_term;
        self.commit_index = self.commit_index.max(self.snapshot_index);
        self.last_applied = self.last_applied.max(self.snapshot_index);
        Ok(true)
    }
}

fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

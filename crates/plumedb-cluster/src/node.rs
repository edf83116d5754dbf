//! ClusterNode — ties the consensus log to the cluster state machine.
//!
//! The node owns both halves and is the only caller of `apply`: committed
//! entries are drained from the raft log and applied strictly in index
//! order, which is what makes the state machine a safe serialization point
//! without internal locking. Other components hold read-only topology
//! snapshots refreshed through the subscription channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};

use crate::config::ClusterConfig;
use crate::consensus::raft::{
    AppendEntriesRequest, AppendEntriesResponse, RaftNode, RaftState, VoteRequest, VoteResponse,
};
use crate::consensus::storage::RaftStorage;
use crate::error::{ClusterError, Result};
use crate::topology::state_machine::{ApplyOutcome, ClusterStateMachine, TopologySnapshot};
use crate::topology::{Command, ShardTopology, StateSnapshot};

/// Summary of one node's view of the cluster.
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub node_id: String,
    pub state: RaftState,
    pub term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub active_migrations: usize,
}

/// One node of the cluster core: raft log + replicated state machine.
pub struct ClusterNode {
    pub config: ClusterConfig,
    raft: Mutex<RaftNode>,
    state_machine: Mutex<ClusterStateMachine>,
    /// Latest applied topology, refreshed after every apply pass.
    topology: RwLock<TopologySnapshot>,
}

impl ClusterNode {
    /// Recover a node from durable raft storage. If a compaction snapshot
    /// exists the state machine restores from it; the committed suffix is
    /// re-applied as the log re-commits after restart.
    pub fn new(
        config: ClusterConfig,
        initial_topology: ShardTopology,
        storage: Box<dyn RaftStorage>,
    ) -> Result<Arc<Self>> {
        let persisted_snapshot = storage.load()?.snapshot;
        let state_machine = match persisted_snapshot {
            Some(snapshot) => ClusterStateMachine::restore(snapshot),
            None => ClusterStateMachine::new(initial_topology),
        };
        let raft = RaftNode::new(&config.node_id, config.peers.clone(), &config, storage)?;
        let topology = state_machine.snapshot();
        Ok(Arc::new(Self {
            config,
            raft: Mutex::new(raft),
            state_machine: Mutex::new(state_machine),
            topology: RwLock::new(topology),
        }))
    }

    /// Win leadership outright. Valid only for a single-node cluster, where
    /// the self-vote is already a majority.
    pub fn bootstrap_single(&self) -> Result<()> {
        let mut raft = self.raft.lock();
        if !raft.peers().is_empty() {
            return Err(ClusterError::InvalidTopology(
                "bootstrap_single requires an empty peer set".to_string(),
            ));
        }
        raft.start_election()?;
        drop(raft);
        self.apply_committed()?;
        Ok(())
    }

    pub fn is_leader(&self) -> bool {
        self.raft.lock().is_leader()
    }

    pub fn current_term(&self) -> u64 {
        self.raft.lock().current_term()
    }

    /// Current topology view; cheap to clone and safe to hold across calls.
    pub fn topology(&self) -> TopologySnapshot {
        self.topology.read().clone()
    }

    /// Subscribe to topology change notifications.
    pub fn subscribe_topology(&self) -> Receiver<TopologySnapshot> {
        self.state_machine.lock().subscribe()
    }

    pub fn status(&self) -> ClusterStatus {
        let raft = self.raft.lock();
        let sm = self.state_machine.lock();
        ClusterStatus {
            node_id: self.config.node_id.clone(),
            state: raft.state(),
            term: raft.current_term(),
            commit_index: raft.commit_index(),
            last_applied: sm.last_applied(),
            active_migrations: sm.snapshot().migrations.len(),
        }
    }

    /// Propose a command without waiting for it to apply. Topology commands
    /// are validated here — apply trusts the log.
    pub fn propose(&self, command: Command) -> Result<u64> {
        if let Command::PutShardTopology(topology) = &command {
            topology.validate()?;
        }
        self.raft.lock().propose(command)
    }

    /// Propose and surface the state machine's verdict if the entry
    /// commits and applies immediately (single-node commit path).
    /// Non-blocking; [`Self::propose_and_wait`] blocks with a timeout.
    pub fn propose_and_apply(&self, command: Command) -> Result<u64> {
        let index = self.propose(command)?;
        match self.apply_up_to(index)? {
            Some(ApplyOutcome::Rejected(e)) => Err(e),
            _ => Ok(index),
        }
    }

    /// Propose and block until the entry commits and applies, polling
    /// between heartbeats while the transport drives replication. On
    /// expiry the caller gets `Timeout` (or `NotLeader` if leadership was
    /// lost meanwhile) and must re-check leadership before retrying; the
    /// entry may still commit later.
    pub fn propose_and_wait(&self, command: Command) -> Result<u64> {
        let index = self.propose(command)?;
        let deadline = Instant::now() + Duration::from_millis(self.config.propose_timeout_ms);
        loop {
            if let Some(outcome) = self.apply_up_to(index)? {
                return match outcome {
                    ApplyOutcome::Rejected(e) => Err(e),
                    _ => Ok(index),
                };
            }
            if self.state_machine.lock().last_applied() >= index {
                return Ok(index);
            }
            if Instant::now() >= deadline {
                if !self.is_leader() {
                    return Err(ClusterError::NotLeader {
                        term: self.current_term(),
                    });
                }
                return Err(ClusterError::Timeout(self.config.propose_timeout_ms));
            }
            std::thread::sleep(Duration::from_millis(self.config.heartbeat_interval_ms));
        }
    }

    /// Drain committed entries into the state machine, in index order.
    pub fn apply_committed(&self) -> Result<()> {
        self.apply_up_to(u64::MAX).map(|_| ())
    }

    fn apply_up_to(&self, watch_index: u64) -> Result<Option<ApplyOutcome>> {
        let mut raft = self.raft.lock();
        let entries = raft.entries_to_apply();
        if entries.is_empty() {
            return Ok(None);
        }

        let mut sm = self.state_machine.lock();
        let mut watched = None;
        let mut last = 0;
        for entry in entries {
            let outcome = sm.apply(entry.index, entry.term, &entry.command);
            if entry.index == watch_index {
                watched = Some(outcome);
            } else if let ApplyOutcome::Rejected(e) = outcome {
                // Rejections of entries proposed elsewhere are normal during
                // replay; they change nothing but are worth a trace.
                tracing::debug!(index = entry.index, error = %e, "entry logically rejected");
            }
            last = entry.index;
        }
        raft.mark_applied(last);
        *self.topology.write() = sm.snapshot();

        self.maybe_compact(&mut raft, &sm)?;
        Ok(watched)
    }

    fn maybe_compact(&self, raft: &mut RaftNode, sm: &ClusterStateMachine) -> Result<()> {
        if sm.last_applied() - raft.snapshot_index() >= self.config.snapshot_interval {
            raft.compact_log(&sm.state_snapshot())?;
        }
        Ok(())
    }

    /// Full state-machine snapshot, for shipping to a follower that has
    /// fallen behind the compacted log prefix.
    pub fn state_snapshot(&self) -> StateSnapshot {
        self.state_machine.lock().state_snapshot()
    }

    /// True when the follower's next index predates the compacted prefix
    /// and it must be caught up via [`Self::install_snapshot`].
    pub fn follower_needs_snapshot(&self, peer_id: &str) -> bool {
        self.raft.lock().follower_needs_snapshot(peer_id)
    }

    // ---- consensus RPC surface, driven by the transport layer ----

    pub fn handle_vote_request(&self, req: &VoteRequest) -> Result<VoteResponse> {
        self.raft.lock().handle_vote_request(req)
    }

    pub fn handle_vote_response(&self, resp: &VoteResponse) -> Result<()> {
        self.raft.lock().handle_vote_response(resp)
    }

    pub fn handle_append_entries(&self, req: &AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let resp = self.raft.lock().handle_append_entries(req)?;
        self.apply_committed()?;
        Ok(resp)
    }

    pub fn handle_append_entries_response(
        &self,
        peer_id: &str,
        resp: &AppendEntriesResponse,
    ) -> Result<()> {
        self.raft.lock().handle_append_entries_response(peer_id, resp)?;
        self.apply_committed()
    }

    pub fn create_append_entries(&self, peer_id: &str) -> Option<AppendEntriesRequest> {
        self.raft.lock().create_append_entries(peer_id)
    }

    pub fn start_election(&self) -> Result<VoteRequest> {
        self.raft.lock().start_election()
    }

    pub fn election_timeout_elapsed(&self) -> bool {
        self.raft.lock().election_timeout_elapsed()
    }

    pub fn install_snapshot(&self, term: u64, snapshot: &StateSnapshot) -> Result<bool> {
        let installed = self.raft.lock().install_snapshot(term, snapshot)?;
        if installed {
            let mut sm = self.state_machine.lock();
            *sm = ClusterStateMachine::restore(snapshot.clone());
            *self.topology.write() = sm.snapshot();
        }
        Ok(installed)
    }
}

//! Deterministic cluster state machine.
//!
//! One instance per cluster, replicated identically on every node: applying
//! the same committed log prefix always yields the same topology, migration
//! table, and cutoff. `apply` is a pure state transition — no I/O, no
//! network — and is invoked strictly in committed-index order by the node's
//! apply loop. Entries at or below the last applied index are replay no-ops.

use std::collections::BTreeMap;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::topology::{BucketMigration, Command, MigrationStatus, ShardTopology};

/// Result of applying a committed entry.
#[derive(Debug)]
pub enum ApplyOutcome {
    /// State changed.
    Applied,
    /// Replayed, stale, or intentionally ignored entry; no state change.
    NoOp,
    /// Logically rejected; no state change. The reason is surfaced to the
    /// proposer, never treated as a log-level failure.
    Rejected(ClusterError),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// Read-only view of the replicated state, handed to other components on
/// every topology change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    /// Log index this view was derived from.
    pub version: u64,
    pub topology: ShardTopology,
    pub migrations: BTreeMap<u32, BucketMigration>,
    pub cutoff: u64,
}

impl TopologySnapshot {
    pub fn owner_of(&self, bucket: u32) -> Option<&str> {
        self.topology.owner_of(bucket)
    }

    pub fn migration(&self, bucket: u32) -> Option<&BucketMigration> {
        self.migrations.get(&bucket)
    }
}

/// Serialized state-machine prefix for raft log compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub topology: ShardTopology,
    pub migrations: BTreeMap<u32, BucketMigration>,
    pub cutoff: u64,
    pub config: BTreeMap<String, String>,
}

/// The authoritative topology, derived solely from committed log entries.
pub struct ClusterStateMachine {
    topology: ShardTopology,
    migrations: BTreeMap<u32, BucketMigration>,
    cutoff: u64,
    config: BTreeMap<String, String>,
    last_applied: u64,
    last_applied_term: u64,
    subscribers: Vec<Sender<TopologySnapshot>>,
}

impl ClusterStateMachine {
    pub fn new(initial: ShardTopology) -> Self {
        Self {
            topology: initial,
            migrations: BTreeMap::new(),
            cutoff: 0,
            config: BTreeMap::new(),
            last_applied: 0,
            last_applied_term: 0,
            subscribers: Vec::new(),
        }
    }

    /// Rebuild from a compacted snapshot; the log suffix is replayed on top.
    pub fn restore(snapshot: StateSnapshot) -> Self {
        Self {
            topology: snapshot.topology,
            migrations: snapshot.migrations,
            cutoff: snapshot.cutoff,
            config: snapshot.config,
            last_applied: snapshot.last_included_index,
            last_applied_term: snapshot.last_included_term,
            subscribers: Vec::new(),
        }
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn cutoff(&self) -> u64 {
        self.cutoff
    }

    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(|s| s.as_str())
    }

    /// Subscribe to topology changes. Every applied topology-affecting
    /// entry delivers a fresh snapshot.
    pub fn subscribe(&mut self) -> Receiver<TopologySnapshot> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            version: self.last_applied,
            topology: self.topology.clone(),
            migrations: self.migrations.clone(),
            cutoff: self.cutoff,
        }
    }

    /// Serialize the full state for raft log compaction.
    pub fn state_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            last_included_index: self.last_applied,
            last_included_term: self.last_applied_term,
            topology: self.topology.clone(),
            migrations: self.migrations.clone(),
            cutoff: self.cutoff,
            config: self.config.clone(),
        }
    }

    /// Apply one committed entry. Deterministic and idempotent when replayed
    /// from the same log prefix.
    pub fn apply(&mut self, index: u64, term: u64, command: &Command) -> ApplyOutcome {
        if index <= self.last_applied {
            return ApplyOutcome::NoOp;
        }
        self.last_applied = index;
        self.last_applied_term = term;

        let outcome = match command {
            Command::Noop => ApplyOutcome::NoOp,
            Command::PutShardTopology(topology) => {
                // Validated at propose time; the log is trusted here.
                self.topology = topology.clone();
                ApplyOutcome::Applied
            }
            Command::StartBucketMigration { bucket, dest_shard } => {
                self.start_migration(index, *bucket, dest_shard)
            }
            Command::ReportBucketMoved { bucket, last_etag } => {
                self.report_moved(*bucket, *last_etag)
            }
            Command::ConfirmBucketMigration { bucket } => self.confirm_migration(*bucket),
            Command::CompleteBucketMigration { bucket } => self.complete_migration(*bucket),
            Command::AbortBucketMigration { bucket } => {
                match self.migrations.remove(bucket) {
                    Some(_) => ApplyOutcome::Applied,
                    None => ApplyOutcome::NoOp,
                }
            }
            Command::AdvanceMigrationCutoff { index: new_cutoff } => {
                if *new_cutoff < self.cutoff {
                    ApplyOutcome::NoOp
                } else {
                    self.cutoff = *new_cutoff;
                    ApplyOutcome::Applied
                }
            }
            Command::PutConfigValue { key, value } => {
                self.config.insert(key.clone(), value.clone());
                ApplyOutcome::Applied
            }
        };

        if outcome.is_applied() {
            self.notify();
        }
        outcome
    }

    fn start_migration(&mut self, index: u64, bucket: u32, dest: &str) -> ApplyOutcome {
        if self.migrations.contains_key(&bucket) {
            return ApplyOutcome::Rejected(ClusterError::MigrationAlreadyActive(bucket));
        }
        let source = match self.topology.owner_of(bucket) {
            Some(owner) => owner.to_string(),
            None => {
                return ApplyOutcome::Rejected(ClusterError::InvalidTopology(format!(
                    "bucket {bucket} has no owner"
                )))
            }
        };
        if source == dest {
            return ApplyOutcome::Rejected(ClusterError::InvalidTopology(format!(
                "shard {dest} already owns bucket {bucket}"
            )));
        }
        self.migrations.insert(
            bucket,
            BucketMigration {
                bucket,
                source_shard: source,
                dest_shard: dest.to_string(),
                started_at_index: index,
                status: MigrationStatus::Pending,
                last_moved_etag: 0,
            },
        );
        ApplyOutcome::Applied
    }

    fn report_moved(&mut self, bucket: u32, last_etag: u64) -> ApplyOutcome {
        let Some(migration) = self.migrations.get_mut(&bucket) else {
            return ApplyOutcome::Rejected(ClusterError::MigrationNotFound(bucket));
        };
        match migration.status {
            MigrationStatus::Pending | MigrationStatus::Moved => {
                migration.status = MigrationStatus::Moved;
                migration.last_moved_etag = migration.last_moved_etag.max(last_etag);
                ApplyOutcome::Applied
            }
            MigrationStatus::Confirmed => ApplyOutcome::Rejected(ClusterError::MigrationPhase {
                bucket,
                detail: "already confirmed".to_string(),
            }),
        }
    }

    fn confirm_migration(&mut self, bucket: u32) -> ApplyOutcome {
        let Some(migration) = self.migrations.get_mut(&bucket) else {
            return ApplyOutcome::Rejected(ClusterError::MigrationNotFound(bucket));
        };
        match migration.status {
            MigrationStatus::Moved => {
                migration.status = MigrationStatus::Confirmed;
                ApplyOutcome::Applied
            }
            MigrationStatus::Pending => ApplyOutcome::Rejected(ClusterError::MigrationPhase {
                bucket,
                detail: "documents not yet moved".to_string(),
            }),
            MigrationStatus::Confirmed => ApplyOutcome::NoOp,
        }
    }

    fn complete_migration(&mut self, bucket: u32) -> ApplyOutcome {
        let Some(migration) = self.migrations.get(&bucket) else {
            // Replay of an already-completed migration: logical no-op.
            return ApplyOutcome::Rejected(ClusterError::MigrationAlreadyComplete(bucket));
        };
        if migration.status != MigrationStatus::Confirmed {
            return ApplyOutcome::Rejected(ClusterError::MigrationPhase {
                bucket,
                detail: format!("completion requires Confirmed, found {:?}", migration.status),
            });
        }
        let source = migration.source_shard.clone();
        let dest = migration.dest_shard.clone();
        if let Err(e) = self.topology.transfer_bucket(bucket, &source, &dest) {
            return ApplyOutcome::Rejected(e);
        }
        self.migrations.remove(&bucket);
        ApplyOutcome::Applied
    }

    fn notify(&mut self) {
        let snapshot = self.snapshot();
        self.subscribers
            .retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> ClusterStateMachine {
        let mut topo = ShardTopology::single("shard-1");
        topo.shards.insert("shard-2".into(), Vec::new());
        ClusterStateMachine::new(topo)
    }

    fn start(bucket: u32, dest: &str) -> Command {
        Command::StartBucketMigration {
            bucket,
            dest_shard: dest.to_string(),
        }
    }

    #[test]
    fn test_full_migration_flow() {
        let mut sm = machine();
        assert!(sm.apply(1, 1, &start(100, "shard-2")).is_applied());
        assert_eq!(
            sm.snapshot().migration(100).unwrap().status,
            MigrationStatus::Pending
        );

        assert!(sm
            .apply(
                2,
                1,
                &Command::ReportBucketMoved {
                    bucket: 100,
                    last_etag: 42
                }
            )
            .is_applied());
        assert!(sm
            .apply(3, 1, &Command::ConfirmBucketMigration { bucket: 100 })
            .is_applied());
        assert!(sm
            .apply(4, 1, &Command::CompleteBucketMigration { bucket: 100 })
            .is_applied());

        let snap = sm.snapshot();
        assert_eq!(snap.owner_of(100), Some("shard-2"));
        assert!(snap.migration(100).is_none());
        snap.topology.validate().unwrap();
    }

    #[test]
    fn test_second_migration_for_bucket_rejected() {
        let mut sm = machine();
        sm.apply(1, 1, &start(100, "shard-2"));
        let outcome = sm.apply(2, 1, &start(100, "shard-2"));
        assert!(matches!(
            outcome,
            ApplyOutcome::Rejected(ClusterError::MigrationAlreadyActive(100))
        ));
    }

    #[test]
    fn test_migration_to_current_owner_rejected() {
        let mut sm = machine();
        let outcome = sm.apply(1, 1, &start(100, "shard-1"));
        assert!(matches!(outcome, ApplyOutcome::Rejected(_)));
        assert!(sm.snapshot().migration(100).is_none());
    }

    #[test]
    fn test_complete_requires_confirmed() {
        let mut sm = machine();
        sm.apply(1, 1, &start(100, "shard-2"));
        let outcome = sm.apply(2, 1, &Command::CompleteBucketMigration { bucket: 100 });
        assert!(matches!(
            outcome,
            ApplyOutcome::Rejected(ClusterError::MigrationPhase { .. })
        ));
        assert_eq!(sm.snapshot().owner_of(100), Some("shard-1"));
    }

    #[test]
    fn test_complete_replay_is_logical_noop() {
        let mut sm = machine();
        sm.apply(1, 1, &start(100, "shard-2"));
        sm.apply(
            2,
            1,
            &Command::ReportBucketMoved {
                bucket: 100,
                last_etag: 1,
            },
        );
        sm.apply(3, 1, &Command::ConfirmBucketMigration { bucket: 100 });
        sm.apply(4, 1, &Command::CompleteBucketMigration { bucket: 100 });

        // A later duplicate completion surfaces MigrationAlreadyComplete
        // without touching state.
        let before = sm.snapshot();
        let outcome = sm.apply(5, 1, &Command::CompleteBucketMigration { bucket: 100 });
        assert!(matches!(
            outcome,
            ApplyOutcome::Rejected(ClusterError::MigrationAlreadyComplete(100))
        ));
        let after = sm.snapshot();
        assert_eq!(before.topology, after.topology);
    }

    #[test]
    fn test_replayed_index_is_noop() {
        let mut sm = machine();
        sm.apply(1, 1, &start(100, "shard-2"));
        // Same index again — replay from the log is idempotent.
        let outcome = sm.apply(1, 1, &start(100, "shard-2"));
        assert!(matches!(outcome, ApplyOutcome::NoOp));
    }

    #[test]
    fn test_cutoff_monotone() {
        let mut sm = machine();
        assert!(sm
            .apply(1, 1, &Command::AdvanceMigrationCutoff { index: 5 })
            .is_applied());
        assert_eq!(sm.cutoff(), 5);
        let outcome = sm.apply(2, 1, &Command::AdvanceMigrationCutoff { index: 3 });
        assert!(matches!(outcome, ApplyOutcome::NoOp));
        assert_eq!(sm.cutoff(), 5);
    }

    #[test]
    fn test_abort_pending_migration() {
        let mut sm = machine();
        sm.apply(1, 1, &start(100, "shard-2"));
        assert!(sm
            .apply(2, 1, &Command::AbortBucketMigration { bucket: 100 })
            .is_applied());
        assert!(sm.snapshot().migration(100).is_none());
        assert_eq!(sm.snapshot().owner_of(100), Some("shard-1"));
    }

    #[test]
    fn test_put_topology_replaces_table() {
        let mut sm = machine();
        let mut topo = ShardTopology::default();
        topo.shards
            .insert("shard-2".into(), vec![crate::topology::BucketRange::new(0, 65535)]);
        assert!(sm
            .apply(1, 1, &Command::PutShardTopology(topo))
            .is_applied());
        assert_eq!(sm.snapshot().owner_of(0), Some("shard-2"));
    }

    #[test]
    fn test_replay_determinism() {
        let commands = vec![
            start(100, "shard-2"),
            Command::ReportBucketMoved {
                bucket: 100,
                last_etag: 7,
            },
            Command::ConfirmBucketMigration { bucket: 100 },
            Command::CompleteBucketMigration { bucket: 100 },
            Command::AdvanceMigrationCutoff { index: 1 },
            Command::PutConfigValue {
                key: "rebalance.auto".into(),
                value: "off".into(),
            },
        ];

        let mut a = machine();
        let mut b = machine();
        for (i, cmd) in commands.iter().enumerate() {
            a.apply(i as u64 + 1, 1, cmd);
        }
        for (i, cmd) in commands.iter().enumerate() {
            b.apply(i as u64 + 1, 1, cmd);
        }

        let sa = serde_json::to_vec(&a.state_snapshot()).unwrap();
        let sb = serde_json::to_vec(&b.state_snapshot()).unwrap();
        assert_eq!(sa, sb);
    }

    #[test]
    fn test_subscribe_receives_changes() {
        let mut sm = machine();
        let rx = sm.subscribe();
        sm.apply(1, 1, &start(100, "shard-2"));
        let snap = rx.try_recv().unwrap();
        assert!(snap.migration(100).is_some());
        assert_eq!(snap.version, 1);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut sm = machine();
        sm.apply(1, 1, &start(100, "shard-2"));
        sm.apply(
            2,
            1,
            &Command::ReportBucketMoved {
                bucket: 100,
                last_etag: 3,
            },
        );
        let snapshot = sm.state_snapshot();

        let restored = ClusterStateMachine::restore(snapshot.clone());
        assert_eq!(restored.last_applied(), 2);
        assert_eq!(restored.state_snapshot(), snapshot);
    }
}

//! Migration coordinator — orchestrates the three-phase bucket hand-off.
//!
//! Per bucket: **Pending** (start committed, writes still route to the
//! source, documents are copied), **Moved** (the captured snapshot etag is
//! fully replicated; the destination accepts writes and tags change vectors
//! with the migration's move tag), **Confirmed** (the source stops accepting
//! writes and ownership switches via `CompleteBucketMigration`).
//!
//! Distinct buckets migrate fully in parallel. Within one bucket, phases are
//! strictly sequential and each boundary is a consensus commit — callers
//! must treat transitions as blocking operations with timeouts, not local
//! calls. A migration may be quietly aborted only while Pending; once Moved
//! the destination holds authoritative writes and rollback must go through
//! the compensating `AbortBucketMigration` command.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use plumedb_core::{DocStore, DocumentRecord};

use crate::error::{ClusterError, Result};
use crate::migration::throttle::TransferThrottle;
use crate::node::ClusterNode;
use crate::topology::{BucketMigration, Command, MigrationStatus};

/// Copy progress for one in-flight bucket migration.
#[derive(Debug, Clone)]
struct CopyProgress {
    /// Highest etag in the bucket when the migration started; the copy is
    /// complete once everything at or below it has been shipped.
    captured_etag: u64,
    /// Highest etag acknowledged by the destination so far.
    sent_etag: u64,
}

/// Outcome of polling for the next copy batch.
#[derive(Debug)]
pub enum CopyBatch {
    /// Documents ready to ship to the destination.
    Ready(Vec<DocumentRecord>),
    /// The bandwidth budget is exhausted; retry after a refill.
    Throttled,
    /// Everything acknowledged so far covers the bucket; nothing to ship.
    Drained,
}

/// Orchestrates bucket migrations, issuing consensus commands at each
/// phase boundary.
pub struct MigrationCoordinator {
    node: Arc<ClusterNode>,
    store: Arc<dyn DocStore>,
    throttle: TransferThrottle,
    batch_size: usize,
    progress: Mutex<HashMap<u32, CopyProgress>>,
}

impl MigrationCoordinator {
    pub fn new(node: Arc<ClusterNode>, store: Arc<dyn DocStore>) -> Self {
        let throttle = TransferThrottle::new(node.config.migration_rate_limit);
        let batch_size = node.config.replication_batch_size;
        Self {
            node,
            store,
            throttle,
            batch_size,
            progress: Mutex::new(HashMap::new()),
        }
    }

    /// Begin migrating a bucket to another shard. Validates against the
    /// current topology at propose time; the committed index becomes the
    /// migration index carried by move tags.
    pub fn start_migration(&self, bucket: u32, dest_shard: &str) -> Result<u64> {
        let topo = self.node.topology();
        if !topo.topology.has_shard(dest_shard) {
            return Err(ClusterError::ShardNotFound(dest_shard.to_string()));
        }
        if topo.owner_of(bucket) == Some(dest_shard) {
            return Err(ClusterError::InvalidTopology(format!(
                "shard {dest_shard} already owns bucket {bucket}"
            )));
        }
        if topo.migration(bucket).is_some() {
            return Err(ClusterError::MigrationAlreadyActive(bucket));
        }

        // The copy target is the bucket's own high-water mark: other
        // buckets keep writing and must not hold this migration open.
        let captured_etag = self
            .store
            .scan_bucket(bucket)
            .last()
            .map(|d| d.etag)
            .unwrap_or(0);
        let index = self.node.propose_and_wait(Command::StartBucketMigration {
            bucket,
            dest_shard: dest_shard.to_string(),
        })?;

        self.progress.lock().insert(
            bucket,
            CopyProgress {
                captured_etag,
                sent_etag: 0,
            },
        );
        tracing::info!(bucket, dest_shard, index, "bucket migration started");
        Ok(index)
    }

    /// Next batch of documents to ship to the destination, bounded by the
    /// batch size and the bandwidth throttle.
    pub fn next_copy_batch(&self, bucket: u32) -> Result<CopyBatch> {
        let sent_etag = {
            let progress = self.progress.lock();
            let p = progress
                .get(&bucket)
                .ok_or(ClusterError::MigrationNotFound(bucket))?;
            p.sent_etag
        };

        let batch: Vec<DocumentRecord> = self
            .store
            .scan_bucket(bucket)
            .into_iter()
            .filter(|d| d.etag > sent_etag)
            .take(self.batch_size)
            .collect();
        if batch.is_empty() {
            return Ok(CopyBatch::Drained);
        }

        let bytes: u64 = batch.iter().map(|d| d.payload.len() as u64).sum();
        if !self.throttle.try_acquire(bytes) {
            return Ok(CopyBatch::Throttled);
        }
        Ok(CopyBatch::Ready(batch))
    }

    /// Record that a copy batch was durably applied on the destination.
    /// Once the captured snapshot etag is covered, the migration advances
    /// to Moved via consensus.
    pub fn report_batch_sent(&self, bucket: u32, last_etag_sent: u64) -> Result<()> {
        let caught_up = {
            let mut progress = self.progress.lock();
            let p = progress
                .get_mut(&bucket)
                .ok_or(ClusterError::MigrationNotFound(bucket))?;
            p.sent_etag = p.sent_etag.max(last_etag_sent);
            p.sent_etag >= p.captured_etag
        };

        if caught_up {
            self.node.propose_and_wait(Command::ReportBucketMoved {
                bucket,
                last_etag: last_etag_sent,
            })?;
            tracing::info!(bucket, last_etag_sent, "bucket copy caught up; now Moved");
        }
        Ok(())
    }

    /// Confirm the migration and switch ownership: the source stops
    /// accepting writes for the bucket, then `CompleteBucketMigration`
    /// makes the destination authoritative for routing.
    pub fn confirm_migration(&self, bucket: u32) -> Result<()> {
        let status = self.status(bucket).ok_or(ClusterError::MigrationNotFound(bucket))?;
        if status.status == MigrationStatus::Pending {
            return Err(ClusterError::MigrationPhase {
                bucket,
                detail: "cannot confirm before documents are moved".to_string(),
            });
        }

        if status.status == MigrationStatus::Moved {
            self.node
                .propose_and_wait(Command::ConfirmBucketMigration { bucket })?;
        }
        self.node
            .propose_and_wait(Command::CompleteBucketMigration { bucket })?;
        self.progress.lock().remove(&bucket);
        tracing::info!(bucket, "bucket migration complete");
        Ok(())
    }

    /// Abort a migration. Quiet while Pending; once Moved this issues the
    /// compensating command because the destination already accepted
    /// authoritative writes. Never valid once Confirmed.
    pub fn abort_migration(&self, bucket: u32) -> Result<()> {
        let status = self.status(bucket).ok_or(ClusterError::MigrationNotFound(bucket))?;
        match status.status {
            MigrationStatus::Confirmed => Err(ClusterError::MigrationPhase {
                bucket,
                detail: "cannot abort a confirmed migration".to_string(),
            }),
            MigrationStatus::Moved => {
                tracing::warn!(bucket, "rolling back moved migration via compensating abort");
                self.node
                    .propose_and_wait(Command::AbortBucketMigration { bucket })?;
                self.progress.lock().remove(&bucket);
                Ok(())
            }
            MigrationStatus::Pending => {
                self.node
                    .propose_and_wait(Command::AbortBucketMigration { bucket })?;
                self.progress.lock().remove(&bucket);
                Ok(())
            }
        }
    }

    /// Re-target a migration whose destination failed before Confirmed.
    pub fn retarget(&self, bucket: u32, new_dest: &str) -> Result<u64> {
        let status = self.status(bucket).ok_or(ClusterError::MigrationNotFound(bucket))?;
        if status.status == MigrationStatus::Confirmed {
            return Err(ClusterError::MigrationPhase {
                bucket,
                detail: "cannot re-target after confirmation".to_string(),
            });
        }
        self.abort_migration(bucket)?;
        self.start_migration(bucket, new_dest)
    }

    /// Raise the cluster-wide compaction cutoff. When to call this is a
    /// policy decision: the given index must already be observed by every
    /// live node, or stale replicas could misread post-migration writes.
    pub fn advance_cutoff(&self, index: u64) -> Result<u64> {
        self.node
            .propose_and_wait(Command::AdvanceMigrationCutoff { index })
    }

    /// Current migration record for a bucket, if one is active.
    pub fn status(&self, bucket: u32) -> Option<BucketMigration> {
        self.node.topology().migration(bucket).cloned()
    }
}

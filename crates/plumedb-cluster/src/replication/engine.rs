//! Per-document replication between shard replicas.
//!
//! Documents flow as advertisements: the sender streams every record with an
//! etag above the receiver's last acknowledged position, the receiver gates
//! each record on bucket ownership and merges it through change-vector
//! comparison. Acknowledged etags are tracked per peer so a restarted or
//! partitioned replica resumes from where it left off instead of replaying
//! the full store.
//!
//! Bucket ownership follows the latest [`TopologySnapshot`] pushed in by the
//! node's apply loop. During a migration the destination becomes an accepted
//! sender from the Moved phase onward; the source keeps its claim through
//! its still-committed range ownership until completion transfers the range,
//! so both sides can flush their tails mid-hand-off.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use plumedb_core::{bucket_of, ChangeVector, DocStore, DocumentRecord, MoveTag, VectorRelation};

use crate::error::{ClusterError, Result};
use crate::replication::conflict::{ConflictStrategy, LastWriteWins, Resolution};
use crate::topology::state_machine::TopologySnapshot;
use crate::topology::MigrationStatus;

const BUCKET_LOCK_STRIPES: usize = 64;

/// One document on the wire. Etags are store-local and never travel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentAdvertisement {
    pub id: String,
    pub bucket: u32,
    pub change_vector: ChangeVector,
    pub payload: Vec<u8>,
    pub is_tombstone: bool,
    pub modified_at_ms: u64,
}

impl DocumentAdvertisement {
    pub fn from_record(record: &DocumentRecord) -> Self {
        Self {
            id: record.id.clone(),
            bucket: record.bucket,
            change_vector: record.change_vector.clone(),
            payload: record.payload.clone(),
            is_tombstone: record.is_tombstone,
            modified_at_ms: record.modified_at_ms,
        }
    }
}

/// Replication counters, monotone since engine creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicationStats {
    pub applied: u64,
    pub skipped: u64,
    pub conflicts: u64,
    pub dropped: u64,
}

/// Applies local writes and incoming replication batches against one
/// replica's document store.
pub struct ReplicationEngine {
    shard_id: String,
    node_id: String,
    store: Arc<dyn DocStore>,
    topology: RwLock<TopologySnapshot>,
    strategy: Box<dyn ConflictStrategy>,
    bucket_locks: Vec<Mutex<()>>,
    peer_acks: Mutex<HashMap<String, u64>>,
    applied: AtomicU64,
    skipped: AtomicU64,
    conflicts: AtomicU64,
    dropped: AtomicU64,
}

impl ReplicationEngine {
    pub fn new(
        shard_id: impl Into<String>,
        node_id: impl Into<String>,
        store: Arc<dyn DocStore>,
        topology: TopologySnapshot,
    ) -> Self {
        let bucket_locks = (0..BUCKET_LOCK_STRIPES).map(|_| Mutex::new(())).collect();
        Self {
            shard_id: shard_id.into(),
            node_id: node_id.into(),
            store,
            topology: RwLock::new(topology),
            strategy: Box::new(LastWriteWins),
            bucket_locks,
            peer_acks: Mutex::new(HashMap::new()),
            applied: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn ConflictStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// Install a newer topology view. Called from the node's apply loop on
    /// every committed topology change.
    pub fn update_topology(&self, snapshot: TopologySnapshot) {
        let mut current = self.topology.write();
        if snapshot.version >= current.version {
            *current = snapshot;
        }
    }

    pub fn topology(&self) -> TopologySnapshot {
        self.topology.read().clone()
    }

    /// Write a document through this shard. Routing is checked against the
    /// current topology: the owner accepts writes until its migration is
    /// confirmed, the migration destination from the Moved phase onward.
    /// Destination-side writes during a migration carry a move tag so their
    /// causal order against pre-move writes stays decidable.
    pub fn write_document(&self, id: &str, payload: Vec<u8>) -> Result<DocumentRecord> {
        self.store_local(id, payload, false)
    }

    /// Delete a document: a tombstone write, replicated like any other.
    pub fn delete_document(&self, id: &str) -> Result<DocumentRecord> {
        self.store_local(id, Vec::new(), true)
    }

    fn store_local(&self, id: &str, payload: Vec<u8>, tombstone: bool) -> Result<DocumentRecord> {
        let bucket = bucket_of(id);
        let topology = self.topology.read().clone();
        let tag = self.write_tag(&topology, bucket)?;

        let _guard = self.bucket_lock(bucket).lock();
        let mut change_vector = self
            .store
            .get(id)
            .map(|d| d.change_vector)
            .unwrap_or_default();
        change_vector.advance(&self.node_id);
        if let Some(tag) = tag {
            change_vector.add_move_tag(tag);
        }

        let mut record = DocumentRecord {
            id: id.to_string(),
            bucket,
            change_vector,
            payload,
            is_tombstone: tombstone,
            modified_at_ms: current_ms(),
            etag: 0,
        };
        record.etag = self.store.put(record.clone())?;
        Ok(record)
    }

    /// Whether this shard may accept the write, and the move tag to stamp if
    /// it is the migration destination.
    fn write_tag(&self, topology: &TopologySnapshot, bucket: u32) -> Result<Option<MoveTag>> {
        let owner = topology
            .owner_of(bucket)
            .ok_or_else(|| ClusterError::InvalidTopology(format!("bucket {bucket} unowned")))?;
        let migration = topology.migration(bucket);

        if owner == self.shard_id {
            let source_still_writable = match migration {
                None => true,
                Some(m) => matches!(m.status, MigrationStatus::Pending | MigrationStatus::Moved),
            };
            if source_still_writable {
                return Ok(None);
            }
        } else if let Some(m) = migration {
            if m.dest_shard == self.shard_id
                && matches!(m.status, MigrationStatus::Moved | MigrationStatus::Confirmed)
            {
                return Ok(Some(MoveTag {
                    from_shard: m.source_shard.clone(),
                    to_shard: m.dest_shard.clone(),
                    migration_index: m.started_at_index,
                }));
            }
        }
        Err(ClusterError::BucketNotOwned {
            bucket,
            shard: self.shard_id.clone(),
        })
    }

    /// Every record with etag above `after`, ready to send to a peer.
    pub fn advertise_since(&self, after: u64, limit: usize) -> Vec<DocumentAdvertisement> {
        self.store
            .scan_since(after)
            .iter()
            .take(limit)
            .map(DocumentAdvertisement::from_record)
            .collect()
    }

    /// Apply a replication batch from `from_shard`. Records from a shard
    /// with no claim on the bucket are dropped and logged, never an error:
    /// the sender may simply hold a staler topology than ours. Returns the
    /// number of records that changed local state.
    pub fn handle_batch(&self, from_shard: &str, batch: &[DocumentAdvertisement]) -> Result<usize> {
        let topology = self.topology.read().clone();
        let mut applied = 0;
        for incoming in batch {
            if !self.sender_allowed(&topology, from_shard, incoming.bucket) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    shard = %self.shard_id,
                    from = %from_shard,
                    bucket = incoming.bucket,
                    doc = %incoming.id,
                    "dropping replicated document from non-owner"
                );
                continue;
            }
            if self.apply_incoming(incoming)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    fn sender_allowed(&self, topology: &TopologySnapshot, from: &str, bucket: u32) -> bool {
        if topology.owner_of(bucket) == Some(from) {
            return true;
        }
        match topology.migration(bucket) {
            Some(m) => match m.status {
                MigrationStatus::Pending => false,
                // Both sides are live writers mid-hand-off.
                MigrationStatus::Moved => m.source_shard == from || m.dest_shard == from,
                MigrationStatus::Confirmed => m.dest_shard == from,
            },
            None => false,
        }
    }

    fn apply_incoming(&self, incoming: &DocumentAdvertisement) -> Result<bool> {
        let _guard = self.bucket_lock(incoming.bucket).lock();
        let local = self.store.get(&incoming.id);

        let record = match local {
            None => self.record_from(incoming, incoming.change_vector.clone()),
            Some(existing) => {
                match incoming.change_vector.compare(&existing.change_vector) {
                    VectorRelation::Before | VectorRelation::Equal => {
                        self.skipped.fetch_add(1, Ordering::Relaxed);
                        return Ok(false);
                    }
                    VectorRelation::After => {
                        self.record_from(incoming, incoming.change_vector.clone())
                    }
                    VectorRelation::Conflict => {
                        self.conflicts.fetch_add(1, Ordering::Relaxed);
                        let remote = self.record_from(incoming, incoming.change_vector.clone());
                        let merged = existing.change_vector.merge(&incoming.change_vector);
                        let mut winner = match self.strategy.resolve(&existing, &remote) {
                            Resolution::KeepLocal => existing,
                            Resolution::TakeRemote => remote,
                        };
                        winner.change_vector = merged;
                        winner.modified_at_ms =
                            winner.modified_at_ms.max(incoming.modified_at_ms);
                        winner
                    }
                }
            }
        };

        self.store.put(record)?;
        self.applied.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn record_from(&self, adv: &DocumentAdvertisement, cv: ChangeVector) -> DocumentRecord {
        DocumentRecord {
            id: adv.id.clone(),
            bucket: adv.bucket,
            change_vector: cv,
            payload: adv.payload.clone(),
            is_tombstone: adv.is_tombstone,
            modified_at_ms: adv.modified_at_ms,
            etag: 0,
        }
    }

    /// Push everything the peer has not acknowledged yet and record the new
    /// acknowledged position. Returns how many records the peer applied.
    pub fn exchange(&self, peer: &ReplicationEngine, batch_limit: usize) -> Result<usize> {
        let after = {
            let acks = self.peer_acks.lock();
            acks.get(&peer.node_id).copied().unwrap_or(0)
        };
        let batch = self.advertise_since(after, batch_limit);
        if batch.is_empty() {
            return Ok(0);
        }
        let highest = self
            .store
            .scan_since(after)
            .iter()
            .take(batch_limit)
            .map(|d| d.etag)
            .max()
            .unwrap_or(after);

        let applied = peer.handle_batch(&self.shard_id, &batch)?;
        self.peer_acks.lock().insert(peer.node_id.clone(), highest);
        Ok(applied)
    }

    /// Drop move tags at or below the cluster-wide cutoff from every record
    /// in the bucket. Records without stale tags are left untouched.
    pub fn compact_bucket(&self, bucket: u32) -> Result<usize> {
        let cutoff = self.topology.read().cutoff;
        let _guard = self.bucket_lock(bucket).lock();
        let mut rewritten = 0;
        for mut record in self.store.scan_bucket(bucket) {
            let before = record.change_vector.clone();
            record.change_vector.compact(cutoff);
            if record.change_vector != before {
                self.store.put(record)?;
                rewritten += 1;
            }
        }
        Ok(rewritten)
    }

    pub fn stats(&self) -> ReplicationStats {
        ReplicationStats {
            applied: self.applied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn bucket_lock(&self, bucket: u32) -> &Mutex<()> {
        &self.bucket_locks[bucket as usize % BUCKET_LOCK_STRIPES]
    }
}

fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plumedb_core::MemoryDocStore;
    use std::collections::BTreeMap;

    use crate::topology::{BucketMigration, BucketRange, ShardTopology};

    fn single_owner(shard: &str) -> TopologySnapshot {
        TopologySnapshot {
            version: 1,
            topology: ShardTopology::single(shard),
            migrations: BTreeMap::new(),
            cutoff: 0,
        }
    }

    fn split_topology() -> ShardTopology {
        let mut topo = ShardTopology::default();
        topo.shards
            .insert("shard-1".into(), vec![BucketRange::new(0, 32767)]);
        topo.shards
            .insert("shard-2".into(), vec![BucketRange::new(32768, 65535)]);
        topo
    }

    fn with_migration(bucket: u32, status: MigrationStatus) -> TopologySnapshot {
        let mut migrations = BTreeMap::new();
        migrations.insert(
            bucket,
            BucketMigration {
                bucket,
                source_shard: "shard-1".into(),
                dest_shard: "shard-2".into(),
                started_at_index: 5,
                status,
                last_moved_etag: 0,
            },
        );
        TopologySnapshot {
            version: 2,
            topology: ShardTopology::single("shard-1"),
            migrations,
            cutoff: 0,
        }
    }

    fn engine(shard: &str, node: &str, topology: TopologySnapshot) -> ReplicationEngine {
        ReplicationEngine::new(shard, node, Arc::new(MemoryDocStore::new()), topology)
    }

    #[test]
    fn test_owner_accepts_write() {
        let eng = engine("shard-1", "n1", single_owner("shard-1"));
        let record = eng.write_document("users/1", b"{}".to_vec()).unwrap();
        assert_eq!(record.change_vector.counter("n1"), 1);
        assert!(record.change_vector.move_tags().is_empty());
    }

    #[test]
    fn test_non_owner_rejects_write() {
        let eng = engine("shard-2", "n2", single_owner("shard-1"));
        let err = eng.write_document("users/1", b"{}".to_vec()).unwrap_err();
        assert!(matches!(err, ClusterError::BucketNotOwned { .. }));
    }

    #[test]
    fn test_dest_write_during_moved_carries_tag() {
        let bucket = bucket_of("users/1");
        let eng = engine("shard-2", "n2", with_migration(bucket, MigrationStatus::Moved));
        let record = eng.write_document("users/1", b"{}".to_vec()).unwrap();
        let tags = record.change_vector.move_tags();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].from_shard, "shard-1");
        assert_eq!(tags[0].to_shard, "shard-2");
        assert_eq!(tags[0].migration_index, 5);
    }

    #[test]
    fn test_dest_write_rejected_while_pending() {
        let bucket = bucket_of("users/1");
        let eng = engine(
            "shard-2",
            "n2",
            with_migration(bucket, MigrationStatus::Pending),
        );
        assert!(eng.write_document("users/1", b"{}".to_vec()).is_err());
    }

    #[test]
    fn test_source_write_rejected_after_confirmed() {
        let bucket = bucket_of("users/1");
        let eng = engine(
            "shard-1",
            "n1",
            with_migration(bucket, MigrationStatus::Confirmed),
        );
        assert!(eng.write_document("users/1", b"{}".to_vec()).is_err());
    }

    #[test]
    fn test_batch_from_non_owner_dropped() {
        let source = engine("shard-1", "n1", single_owner("shard-1"));
        let record = source.write_document("users/1", b"{}".to_vec()).unwrap();
        let adv = DocumentAdvertisement::from_record(&record);

        let receiver = engine("shard-2", "n2", single_owner("shard-1"));
        // shard-3 never owned the bucket.
        let applied = receiver.handle_batch("shard-3", &[adv]).unwrap();
        assert_eq!(applied, 0);
        assert_eq!(receiver.stats().dropped, 1);
        assert!(receiver.store.get("users/1").is_none());
    }

    #[test]
    fn test_both_senders_valid_while_moved() {
        let bucket = bucket_of("users/1");
        let receiver = engine("shard-3", "n3", with_migration(bucket, MigrationStatus::Moved));
        let topo = receiver.topology();
        assert!(receiver.sender_allowed(&topo, "shard-1", bucket));
        assert!(receiver.sender_allowed(&topo, "shard-2", bucket));

        let confirmed = engine(
            "shard-3",
            "n3",
            with_migration(bucket, MigrationStatus::Confirmed),
        );
        let topo = confirmed.topology();
        // Source keeps its owner claim until completion transfers the range.
        assert!(confirmed.sender_allowed(&topo, "shard-1", bucket));
        assert!(confirmed.sender_allowed(&topo, "shard-2", bucket));
        assert!(!confirmed.sender_allowed(&topo, "shard-4", bucket));
    }

    #[test]
    fn test_newer_vector_overwrites() {
        let a = engine("shard-1", "n1", single_owner("shard-1"));
        let b = engine("shard-1", "n2", single_owner("shard-1"));

        let first = a.write_document("users/1", b"v1".to_vec()).unwrap();
        b.handle_batch("shard-1", &[DocumentAdvertisement::from_record(&first)])
            .unwrap();
        let second = a.write_document("users/1", b"v2".to_vec()).unwrap();
        let applied = b
            .handle_batch("shard-1", &[DocumentAdvertisement::from_record(&second)])
            .unwrap();

        assert_eq!(applied, 1);
        assert_eq!(b.store.get("users/1").unwrap().payload, b"v2");
    }

    #[test]
    fn test_stale_vector_skipped() {
        let a = engine("shard-1", "n1", single_owner("shard-1"));
        let b = engine("shard-1", "n2", single_owner("shard-1"));

        let first = a.write_document("users/1", b"v1".to_vec()).unwrap();
        let second = a.write_document("users/1", b"v2".to_vec()).unwrap();
        b.handle_batch("shard-1", &[DocumentAdvertisement::from_record(&second)])
            .unwrap();
        let applied = b
            .handle_batch("shard-1", &[DocumentAdvertisement::from_record(&first)])
            .unwrap();

        assert_eq!(applied, 0);
        assert_eq!(b.stats().skipped, 1);
        assert_eq!(b.store.get("users/1").unwrap().payload, b"v2");
    }

    #[test]
    fn test_conflict_merges_vectors_and_converges() {
        let a = engine("shard-1", "n1", single_owner("shard-1"));
        let b = engine("shard-1", "n2", single_owner("shard-1"));

        let doc_a = a.write_document("users/1", b"from-a".to_vec()).unwrap();
        let doc_b = b.write_document("users/1", b"from-b".to_vec()).unwrap();

        a.handle_batch("shard-1", &[DocumentAdvertisement::from_record(&doc_b)])
            .unwrap();
        b.handle_batch("shard-1", &[DocumentAdvertisement::from_record(&doc_a)])
            .unwrap();

        let at_a = a.store.get("users/1").unwrap();
        let at_b = b.store.get("users/1").unwrap();
        assert_eq!(at_a.payload, at_b.payload);
        assert_eq!(at_a.change_vector, at_b.change_vector);
        assert_eq!(at_a.change_vector.counter("n1"), 1);
        assert_eq!(at_a.change_vector.counter("n2"), 1);
        assert_eq!(a.stats().conflicts, 1);
        assert_eq!(b.stats().conflicts, 1);
    }

    #[test]
    fn test_tombstone_replicates() {
        let a = engine("shard-1", "n1", single_owner("shard-1"));
        let b = engine("shard-1", "n2", single_owner("shard-1"));

        a.write_document("users/1", b"v1".to_vec()).unwrap();
        let tomb = a.delete_document("users/1").unwrap();
        b.handle_batch("shard-1", &[DocumentAdvertisement::from_record(&tomb)])
            .unwrap();

        let stored = b.store.get("users/1").unwrap();
        assert!(stored.is_tombstone);
    }

    #[test]
    fn test_exchange_resumes_from_ack() {
        let a = engine("shard-1", "n1", single_owner("shard-1"));
        let b = engine("shard-1", "n2", single_owner("shard-1"));

        a.write_document("users/1", b"v1".to_vec()).unwrap();
        a.write_document("users/2", b"v1".to_vec()).unwrap();
        assert_eq!(a.exchange(&b, 128).unwrap(), 2);
        // Nothing new: the ack position covers the whole store.
        assert_eq!(a.exchange(&b, 128).unwrap(), 0);

        a.write_document("users/3", b"v1".to_vec()).unwrap();
        assert_eq!(a.exchange(&b, 128).unwrap(), 1);
        assert!(b.store.get("users/3").is_some());
    }

    #[test]
    fn test_split_topology_routes_by_bucket() {
        let topo = TopologySnapshot {
            version: 1,
            topology: split_topology(),
            migrations: BTreeMap::new(),
            cutoff: 0,
        };
        let eng = engine("shard-1", "n1", topo.clone());
        let mut owned = 0;
        let mut rejected = 0;
        for i in 0..32 {
            let id = format!("users/{i}");
            match eng.write_document(&id, b"{}".to_vec()) {
                Ok(record) => {
                    assert_eq!(topo.owner_of(record.bucket), Some("shard-1"));
                    owned += 1;
                }
                Err(ClusterError::BucketNotOwned { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(owned > 0);
        assert!(rejected > 0);
    }

    #[test]
    fn test_compact_bucket_drops_stale_tags() {
        let bucket = bucket_of("users/1");
        let eng = engine("shard-2", "n2", with_migration(bucket, MigrationStatus::Moved));
        eng.write_document("users/1", b"{}".to_vec()).unwrap();
        assert_eq!(
            eng.store
                .get("users/1")
                .unwrap()
                .change_vector
                .move_tags()
                .len(),
            1
        );

        // Cutoff below the tag's migration index keeps it.
        let mut below = with_migration(bucket, MigrationStatus::Moved);
        below.version = 3;
        below.cutoff = 4;
        eng.update_topology(below);
        assert_eq!(eng.compact_bucket(bucket).unwrap(), 0);

        let mut at = with_migration(bucket, MigrationStatus::Moved);
        at.version = 4;
        at.cutoff = 5;
        eng.update_topology(at);
        assert_eq!(eng.compact_bucket(bucket).unwrap(), 1);
        assert!(eng
            .store
            .get("users/1")
            .unwrap()
            .change_vector
            .move_tags()
            .is_empty());
    }
}

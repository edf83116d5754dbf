//! Cluster topology: shards, bucket ranges, and the replicated command set.
//!
//! A topology assigns every bucket in the fixed space to exactly one shard.
//! The partition invariant — ranges pairwise disjoint, union covering the
//! full space — is validated at propose time; `apply` trusts the log.

pub mod state_machine;

use std::collections::BTreeMap;

use plumedb_core::MAX_BUCKET;
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};

pub use state_machine::{ApplyOutcome, ClusterStateMachine, StateSnapshot, TopologySnapshot};

/// Inclusive range of buckets owned by one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketRange {
    pub start: u32,
    pub end: u32,
}

impl BucketRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, bucket: u32) -> bool {
        bucket >= self.start && bucket <= self.end
    }
}

/// Ordered shard table: shard id -> ordered disjoint bucket ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTopology {
    pub shards: BTreeMap<String, Vec<BucketRange>>,
}

impl ShardTopology {
    /// Single shard owning the whole bucket space.
    pub fn single(shard: &str) -> Self {
        let mut shards = BTreeMap::new();
        shards.insert(shard.to_string(), vec![BucketRange::new(0, MAX_BUCKET)]);
        Self { shards }
    }

    /// Shard owning a bucket, per the committed range table.
    pub fn owner_of(&self, bucket: u32) -> Option<&str> {
        for (shard, ranges) in &self.shards {
            if ranges.iter().any(|r| r.contains(bucket)) {
                return Some(shard);
            }
        }
        None
    }

    pub fn has_shard(&self, shard: &str) -> bool {
        self.shards.contains_key(shard)
    }

    /// Check the partition invariant: every bucket in `0..=MAX_BUCKET` is
    /// covered by exactly one range.
    pub fn validate(&self) -> Result<()> {
        let mut all: Vec<BucketRange> = self.shards.values().flatten().copied().collect();
        if all.is_empty() {
            return Err(ClusterError::InvalidTopology("no ranges".to_string()));
        }
        all.sort();
        let mut expected = 0u64;
        for range in &all {
            if range.start > range.end {
                return Err(ClusterError::InvalidTopology(format!(
                    "inverted range [{}, {}]",
                    range.start, range.end
                )));
            }
            if (range.start as u64) != expected {
                return Err(ClusterError::InvalidTopology(format!(
                    "gap or overlap at bucket {expected} (next range starts at {})",
                    range.start
                )));
            }
            expected = range.end as u64 + 1;
        }
        if expected != MAX_BUCKET as u64 + 1 {
            return Err(ClusterError::InvalidTopology(format!(
                "coverage ends at {expected}, expected {}",
                MAX_BUCKET as u64 + 1
            )));
        }
        Ok(())
    }

    /// Transfer one bucket between shards, splitting and coalescing ranges
    /// so the partition invariant is preserved.
    pub fn transfer_bucket(&mut self, bucket: u32, from: &str, to: &str) -> Result<()> {
        let ranges = self
            .shards
            .get_mut(from)
            .ok_or_else(|| ClusterError::ShardNotFound(from.to_string()))?;
        remove_bucket(ranges, bucket).ok_or(ClusterError::BucketNotOwned {
            bucket,
            shard: from.to_string(),
        })?;
        let dest = self
            .shards
            .entry(to.to_string())
            .or_default();
        add_bucket(dest, bucket);
        Ok(())
    }
}

/// Split the range containing `bucket` out of `ranges`. Returns None if no
/// range contains it.
fn remove_bucket(ranges: &mut Vec<BucketRange>, bucket: u32) -> Option<()> {
    let pos = ranges.iter().position(|r| r.contains(bucket))?;
    let range = ranges.remove(pos);
    let mut replacement = Vec::with_capacity(2);
    if range.start < bucket {
        replacement.push(BucketRange::new(range.start, bucket - 1));
    }
    if range.end > bucket {
        replacement.push(BucketRange::new(bucket + 1, range.end));
    }
    for (offset, r) in replacement.into_iter().enumerate() {
        ranges.insert(pos + offset, r);
    }
    Some(())
}

/// Insert `bucket` into `ranges`, coalescing with adjacent ranges.
fn add_bucket(ranges: &mut Vec<BucketRange>, bucket: u32) {
    if ranges.iter().any(|r| r.contains(bucket)) {
        return;
    }
    ranges.push(BucketRange::new(bucket, bucket));
    ranges.sort();
    let mut merged: Vec<BucketRange> = Vec::with_capacity(ranges.len());
    for r in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) if (last.end as u64) + 1 == r.start as u64 => last.end = r.end,
            _ => merged.push(r),
        }
    }
    *ranges = merged;
}

/// Status of a bucket migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    /// Topology commands committed; writes still route to the source while
    /// documents are copied.
    Pending,
    /// Snapshot copied; destination accepts writes, tagging change vectors.
    Moved,
    /// Source stopped accepting writes; completion command in flight.
    Confirmed,
}

/// One bucket's in-flight hand-off. At most one active migration per bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMigration {
    pub bucket: u32,
    pub source_shard: String,
    pub dest_shard: String,
    /// Committed log index of the `StartBucketMigration` entry; becomes the
    /// migration index carried by move tags.
    pub started_at_index: u64,
    pub status: MigrationStatus,
    /// Highest source etag reported copied to the destination.
    pub last_moved_etag: u64,
}

/// Replicated commands, totally ordered by the consensus log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Leader election barrier; commits prior-term entries indirectly.
    Noop,
    /// Replace the full bucket-range table. Validated at propose time.
    PutShardTopology(ShardTopology),
    StartBucketMigration { bucket: u32, dest_shard: String },
    /// Source reports the copy caught up to the captured snapshot etag.
    ReportBucketMoved { bucket: u32, last_etag: u64 },
    ConfirmBucketMigration { bucket: u32 },
    /// Switch range ownership; only valid once the migration is Confirmed.
    CompleteBucketMigration { bucket: u32 },
    /// Compensating command: undo a migration that never reached Confirmed.
    AbortBucketMigration { bucket: u32 },
    /// Raise the compaction cutoff; move tags at or below become permanent.
    AdvanceMigrationCutoff { index: u64 },
    /// Domain configuration update carried on the same log.
    PutConfigValue { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_topology_valid() {
        let topo = ShardTopology::single("shard-1");
        topo.validate().unwrap();
        assert_eq!(topo.owner_of(0), Some("shard-1"));
        assert_eq!(topo.owner_of(MAX_BUCKET), Some("shard-1"));
    }

    #[test]
    fn test_validate_rejects_gap() {
        let mut topo = ShardTopology::default();
        topo.shards
            .insert("a".into(), vec![BucketRange::new(0, 100)]);
        topo.shards
            .insert("b".into(), vec![BucketRange::new(102, MAX_BUCKET)]);
        assert!(topo.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let mut topo = ShardTopology::default();
        topo.shards
            .insert("a".into(), vec![BucketRange::new(0, 100)]);
        topo.shards
            .insert("b".into(), vec![BucketRange::new(100, MAX_BUCKET)]);
        assert!(topo.validate().is_err());
    }

    #[test]
    fn test_transfer_bucket_splits_range() {
        let mut topo = ShardTopology::single("shard-1");
        topo.shards.insert("shard-2".into(), Vec::new());
        // shard-2 starts empty; invariant holds because shard-1 covers all.
        topo.transfer_bucket(100, "shard-1", "shard-2").unwrap();

        topo.validate().unwrap();
        assert_eq!(topo.owner_of(100), Some("shard-2"));
        assert_eq!(topo.owner_of(99), Some("shard-1"));
        assert_eq!(topo.owner_of(101), Some("shard-1"));
        assert_eq!(
            topo.shards["shard-1"],
            vec![BucketRange::new(0, 99), BucketRange::new(101, MAX_BUCKET)]
        );
    }

    #[test]
    fn test_transfer_edge_buckets() {
        let mut topo = ShardTopology::single("a");
        topo.transfer_bucket(0, "a", "b").unwrap();
        topo.transfer_bucket(MAX_BUCKET, "a", "b").unwrap();
        topo.validate().unwrap();
        assert_eq!(topo.owner_of(0), Some("b"));
        assert_eq!(topo.owner_of(MAX_BUCKET), Some("b"));
    }

    #[test]
    fn test_transfer_coalesces_adjacent() {
        let mut topo = ShardTopology::single("a");
        topo.transfer_bucket(10, "a", "b").unwrap();
        topo.transfer_bucket(11, "a", "b").unwrap();
        topo.transfer_bucket(12, "a", "b").unwrap();
        topo.validate().unwrap();
        assert_eq!(topo.shards["b"], vec![BucketRange::new(10, 12)]);
    }

    #[test]
    fn test_transfer_from_non_owner_fails() {
        let mut topo = ShardTopology::single("a");
        topo.shards.insert("b".into(), Vec::new());
        assert!(topo.transfer_bucket(5, "b", "a").is_err());
    }

    #[test]
    fn test_command_serde_roundtrip() {
        let cmd = Command::StartBucketMigration {
            bucket: 100,
            dest_shard: "shard-2".into(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let decoded: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, cmd);
    }
}

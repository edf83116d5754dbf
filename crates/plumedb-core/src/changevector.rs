//! Change vectors — per-document causal version metadata.
//!
//! A change vector maps node ids to monotonically increasing counters, plus
//! an ordered list of move tags recording bucket hand-offs between shards.
//! Two vectors are comparable under a partial order: `A <= B` iff every
//! counter in A is <= the corresponding counter in B (missing entries count
//! as 0). Vectors where neither side dominates are in conflict.
//!
//! Move tags let a replica that only ever talked to the old shard recognize
//! that a post-migration write is newer, even though the counter namespace
//! changed at the shard boundary. Once the cluster-wide cutoff index passes
//! a tag's migration index, every live node already knows the new ownership
//! and the tag is compacted away.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Result of comparing two change vectors under the partial order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorRelation {
    /// Left strictly precedes right.
    Before,
    /// Left strictly succeeds right.
    After,
    /// Identical counters.
    Equal,
    /// Neither side dominates — concurrent writes.
    Conflict,
}

/// Records a bucket hand-off between shards at a committed log index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MoveTag {
    pub from_shard: String,
    pub to_shard: String,
    /// Committed log index of the `StartBucketMigration` that created this tag.
    pub migration_index: u64,
}

/// Per-document causal version: node counters plus migration provenance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeVector {
    counters: BTreeMap<String, u64>,
    move_tags: Vec<MoveTag>,
}

impl ChangeVector {
    /// Empty vector — precedes every non-empty vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a node, 0 when absent.
    pub fn counter(&self, node_id: &str) -> u64 {
        self.counters.get(node_id).copied().unwrap_or(0)
    }

    pub fn move_tags(&self) -> &[MoveTag] {
        &self.move_tags
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Increment this node's counter by one.
    pub fn advance(&mut self, node_id: &str) {
        *self.counters.entry(node_id.to_string()).or_insert(0) += 1;
    }

    /// Append a move tag recording a bucket hand-off. Duplicate tags
    /// (same from/to/index triple) are ignored.
    pub fn add_move_tag(&mut self, tag: MoveTag) {
        if self.move_tags.contains(&tag) {
            return;
        }
        self.move_tags.push(tag);
        self.move_tags.sort();
    }

    /// Coordinate-wise maximum of counters, union of move tags.
    /// Commutative, associative, and idempotent.
    pub fn merge(&self, other: &ChangeVector) -> ChangeVector {
        let mut counters = self.counters.clone();
        for (node, &count) in &other.counters {
            let entry = counters.entry(node.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
        let mut move_tags = self.move_tags.clone();
        for tag in &other.move_tags {
            if !move_tags.contains(tag) {
                move_tags.push(tag.clone());
            }
        }
        move_tags.sort();
        ChangeVector { counters, move_tags }
    }

    /// Compare under the counter partial order. Move tags carry provenance
    /// only and do not participate in ordering.
    pub fn compare(&self, other: &ChangeVector) -> VectorRelation {
        let mut left_ahead = false;
        let mut right_ahead = false;

        for (node, &count) in &self.counters {
            let theirs = other.counter(node);
            if count > theirs {
                left_ahead = true;
            } else if count < theirs {
                right_ahead = true;
            }
        }
        for (node, &count) in &other.counters {
            if !self.counters.contains_key(node) && count > 0 {
                right_ahead = true;
            }
        }

        match (left_ahead, right_ahead) {
            (false, false) => VectorRelation::Equal,
            (true, false) => VectorRelation::After,
            (false, true) => VectorRelation::Before,
            (true, true) => VectorRelation::Conflict,
        }
    }

    /// Drop move tags whose migration index is at or below the cutoff.
    /// Tags above the cutoff must survive: discarding one would let a stale
    /// replica treat a post-migration write as conflicting garbage.
    pub fn compact(&mut self, cutoff: u64) {
        self.move_tags.retain(|t| t.migration_index > cutoff);
    }

    /// Stable textual form, used for deterministic tie-breaking.
    pub fn canonical_string(&self) -> String {
        let mut out = String::new();
        for (node, count) in &self.counters {
            out.push_str(node);
            out.push(':');
            out.push_str(&count.to_string());
            out.push(',');
        }
        for tag in &self.move_tags {
            out.push_str(&format!(
                "M[{}->{}@{}]",
                tag.from_shard, tag.to_shard, tag.migration_index
            ));
        }
        out
    }
}

//! Bucket hashing — maps document ids into the fixed bucket space.
//!
//! Buckets are the unit of shard assignment: every document id hashes to
//! exactly one bucket, and every bucket belongs to exactly one shard at any
//! committed topology. The bucket space never changes size; rebalancing
//! moves buckets, not documents.

use std::hash::{Hash, Hasher};

/// Number of buckets in the fixed key space.
pub const BUCKET_COUNT: u32 = 65536;

/// Highest valid bucket id.
pub const MAX_BUCKET: u32 = BUCKET_COUNT - 1;

/// Map a document id to its bucket.
pub fn bucket_of(doc_id: &str) -> u32 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    doc_id.hash(&mut hasher);
    (hasher.finish() % BUCKET_COUNT as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_is_stable() {
        assert_eq!(bucket_of("users/1"), bucket_of("users/1"));
    }

    #[test]
    fn test_bucket_in_range() {
        for i in 0..1000 {
            let id = format!("doc-{i}");
            assert!(bucket_of(&id) <= MAX_BUCKET);
        }
    }

    #[test]
    fn test_distribution() {
        let mut buckets = std::collections::HashSet::new();
        for i in 0..1000 {
            buckets.insert(bucket_of(&format!("doc-{i}")));
        }
        // 1000 ids should spread over many distinct buckets.
        assert!(buckets.len() > 900, "got only {} buckets", buckets.len());
    }
}

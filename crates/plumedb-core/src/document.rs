//! Document records and the opaque store seam.
//!
//! The cluster core never interprets document payloads: it reads and writes
//! the change vector and routing bucket, and treats storage as a key-value
//! put/get/scan interface keyed by document id and bucket. The physical
//! storage engine plugs in behind [`DocStore`]; [`MemoryDocStore`] is the
//! in-process implementation used by the replication engine and tests.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::changevector::ChangeVector;
use crate::error::Result;

/// A stored document, payload opaque to the cluster core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub bucket: u32,
    pub change_vector: ChangeVector,
    pub payload: Vec<u8>,
    /// Tombstones survive deletion so replication can propagate it.
    pub is_tombstone: bool,
    /// Wall-clock write time, used only for conflict tie-breaking.
    pub modified_at_ms: u64,
    /// Store-assigned monotone sequence number, for resumable catch-up.
    pub etag: u64,
}

/// Opaque key-value seam the storage engine implements.
pub trait DocStore: Send + Sync {
    /// Insert or overwrite a document. The store assigns a fresh etag.
    fn put(&self, doc: DocumentRecord) -> Result<u64>;
    fn get(&self, id: &str) -> Option<DocumentRecord>;
    /// All live records (including tombstones) in a bucket, etag order.
    fn scan_bucket(&self, bucket: u32) -> Vec<DocumentRecord>;
    /// All records with etag strictly greater than `after`, etag order.
    fn scan_since(&self, after: u64) -> Vec<DocumentRecord>;
    /// Highest etag assigned so far (0 when empty).
    fn max_etag(&self) -> u64;
}

/// In-memory document store with monotonically increasing etags.
#[derive(Default)]
pub struct MemoryDocStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    docs: BTreeMap<String, DocumentRecord>,
    next_etag: u64,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().docs.is_empty()
    }
}

impl DocStore for MemoryDocStore {
    fn put(&self, mut doc: DocumentRecord) -> Result<u64> {
        let mut inner = self.inner.write();
        inner.next_etag += 1;
        doc.etag = inner.next_etag;
        let etag = doc.etag;
        inner.docs.insert(doc.id.clone(), doc);
        Ok(etag)
    }

    fn get(&self, id: &str) -> Option<DocumentRecord> {
        self.inner.read().docs.get(id).cloned()
    }

    fn scan_bucket(&self, bucket: u32) -> Vec<DocumentRecord> {
        let inner = self.inner.read();
        let mut docs: Vec<DocumentRecord> = inner
            .docs
            .values()
            .filter(|d| d.bucket == bucket)
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.etag);
        docs
    }

    fn scan_since(&self, after: u64) -> Vec<DocumentRecord> {
        let inner = self.inner.read();
        let mut docs: Vec<DocumentRecord> = inner
            .docs
            .values()
            .filter(|d| d.etag > after)
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.etag);
        docs
    }

    fn max_etag(&self) -> u64 {
        self.inner.read().next_etag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::bucket_of;

    fn doc(id: &str) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            bucket: bucket_of(id),
            change_vector: ChangeVector::new(),
            payload: b"{}".to_vec(),
            is_tombstone: false,
            modified_at_ms: 0,
            etag: 0,
        }
    }

    #[test]
    fn test_put_assigns_monotone_etags() {
        let store = MemoryDocStore::new();
        let e1 = store.put(doc("a")).unwrap();
        let e2 = store.put(doc("b")).unwrap();
        assert!(e2 > e1);
        assert_eq!(store.max_etag(), e2);
    }

    #[test]
    fn test_overwrite_bumps_etag() {
        let store = MemoryDocStore::new();
        store.put(doc("a")).unwrap();
        let e2 = store.put(doc("a")).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap().etag, e2);
    }

    #[test]
    fn test_scan_since() {
        let store = MemoryDocStore::new();
        store.put(doc("a")).unwrap();
        let e2 = store.put(doc("b")).unwrap();
        store.put(doc("c")).unwrap();

        let tail = store.scan_since(e2);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, "c");
    }

    #[test]
    fn test_scan_bucket_filters() {
        let store = MemoryDocStore::new();
        let a = doc("a");
        let bucket = a.bucket;
        store.put(a).unwrap();
        let scanned = store.scan_bucket(bucket);
        assert_eq!(scanned.len(), 1);
        assert!(store.scan_bucket(bucket.wrapping_add(1) % 65536).len() <= 1);
    }
}

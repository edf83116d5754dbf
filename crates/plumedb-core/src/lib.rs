//! PlumeDB core — leaf value types shared by the cluster subsystem.
//!
//! Change vectors order and conflict-detect document writes across replicas
//! and bucket migrations; buckets partition the document key space; the
//! [`document::DocStore`] trait is the opaque seam the physical storage
//! engine plugs into.

pub mod bucket;
pub mod changevector;
pub mod document;
pub mod error;

pub use crate::bucket::{bucket_of, BUCKET_COUNT, MAX_BUCKET};
pub use crate::changevector::{ChangeVector, MoveTag, VectorRelation};
pub use crate::document::{DocStore, DocumentRecord, MemoryDocStore};
pub use crate::error::{PlumeError, Result};

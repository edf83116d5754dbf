//! Bucket migration: multi-phase document hand-off between shards.

pub mod coordinator;
pub mod throttle;

pub use coordinator::{CopyBatch, MigrationCoordinator};
pub use throttle::TransferThrottle;

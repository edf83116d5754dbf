//! Document replication between shard replicas.

pub mod conflict;
pub mod engine;

pub use conflict::{ConflictStrategy, LastWriteWins, Resolution};
pub use engine::{DocumentAdvertisement, ReplicationEngine, ReplicationStats};

//! Conflict resolution for concurrent writes detected by change vectors.

use plumedb_core::DocumentRecord;

/// Which side of a detected conflict survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeepLocal,
    TakeRemote,
}

/// Pluggable policy applied when two change vectors are concurrent.
/// Implementations must be deterministic and symmetric: both replicas see
/// the same pair and must pick the same winner.
pub trait ConflictStrategy: Send + Sync {
    fn resolve(&self, local: &DocumentRecord, remote: &DocumentRecord) -> Resolution;
}

/// Default policy: latest wall-clock write wins, with deterministic
/// tie-breaks on the change vector text and then the payload bytes so both
/// sides of an exchange converge on the same document.
pub struct LastWriteWins;

impl ConflictStrategy for LastWriteWins {
    fn resolve(&self, local: &DocumentRecord, remote: &DocumentRecord) -> Resolution {
        if remote.modified_at_ms != local.modified_at_ms {
            return if remote.modified_at_ms > local.modified_at_ms {
                Resolution::TakeRemote
            } else {
                Resolution::KeepLocal
            };
        }
        let local_cv = local.change_vector.canonical_string();
        let remote_cv = remote.change_vector.canonical_string();
        if remote_cv != local_cv {
            return if remote_cv > local_cv {
                Resolution::TakeRemote
            } else {
                Resolution::KeepLocal
            };
        }
        if remote.payload > local.payload {
            Resolution::TakeRemote
        } else {
            Resolution::KeepLocal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plumedb_core::ChangeVector;

    fn doc(ts: u64, payload: &[u8], node: &str) -> DocumentRecord {
        let mut cv = ChangeVector::new();
        cv.advance(node);
        DocumentRecord {
            id: "doc/1".into(),
            bucket: 0,
            change_vector: cv,
            payload: payload.to_vec(),
            is_tombstone: false,
            modified_at_ms: ts,
            etag: 0,
        }
    }

    #[test]
    fn test_later_write_wins() {
        let strategy = LastWriteWins;
        let local = doc(100, b"a", "n1");
        let remote = doc(200, b"b", "n2");
        assert_eq!(strategy.resolve(&local, &remote), Resolution::TakeRemote);
        assert_eq!(strategy.resolve(&remote, &local), Resolution::KeepLocal);
    }

    #[test]
    fn test_tie_break_is_symmetric() {
        let strategy = LastWriteWins;
        let a = doc(100, b"a", "n1");
        let b = doc(100, b"b", "n2");
        // Whichever side is local, the same document must win.
        let winner_at_a = match strategy.resolve(&a, &b) {
            Resolution::KeepLocal => &a.payload,
            Resolution::TakeRemote => &b.payload,
        };
        let winner_at_b = match strategy.resolve(&b, &a) {
            Resolution::KeepLocal => &b.payload,
            Resolution::TakeRemote => &a.payload,
        };
        assert_eq!(winner_at_a, winner_at_b);
    }
}

//! Error types for replica operations.

use thiserror::Error;

use crate::RecordId;

/// Identity and shape violations. These are reported, never silently fixed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    /// The same id appeared twice in an authoritative record set.
    #[error("duplicate record id: {0:?}")]
    DuplicateRecord(RecordId),

    /// A full-sync record belongs to a different card.
    #[error("record {id:?} belongs to root {got:?}, expected {expected:?}")]
    ForeignRecord {
        id: RecordId,
        expected: RecordId,
        got: RecordId,
    },

    /// The root record is absent (never synced, or torn down).
    #[error("root record missing: {0:?}")]
    MissingRoot(RecordId),

    /// A content record's parent never resolved by the settle point.
    #[error("record {id:?} has unresolved parent {parent:?}")]
    UnresolvedParent {
        id: RecordId,
        parent: Option<RecordId>,
    },
}

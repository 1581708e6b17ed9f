//! Remote store boundary.
//!
//! The store is authoritative. This crate only talks to it through
//! [`RecordStore`]: fetch a card's records, subscribe to a change feed, and
//! commit transactions. Transport framing lives behind the trait.

use async_trait::async_trait;
use futures::stream::BoxStream;

use cardtree_types::{Record, RecordId};

/// Errors crossing the store boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The requested root no longer exists.
    #[error("record not found: {0:?}")]
    NotFound(RecordId),
    /// Communication failure. Retryable by the caller.
    #[error("transport error: {0}")]
    Transport(String),
    /// The store refused a transaction. Nothing was applied.
    #[error("rejected by store: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transport(_))
    }
}

/// One item from a change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    /// Latest known state of each changed record, tombstones included.
    Batch(Vec<Record>),
    /// The feed re-established itself after a gap. Anything may have been
    /// missed.
    Reconnected,
}

/// A change feed. An `Err` item or the end of the stream means the
/// connection is gone; the listener resubscribes.
pub type FeedStream = BoxStream<'static, Result<FeedItem, StoreError>>;

/// Store acknowledgement for a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAck {
    pub upserted: usize,
    /// Records tombstoned by the delete (the target plus any cascade).
    pub deleted: usize,
}

/// The three store contracts the client depends on.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every live record whose `root_id` matches, root included.
    async fn records_by_root(&self, root_id: RecordId) -> Result<Vec<Record>, StoreError>;

    /// Open a change feed scoped to `root_ids`.
    ///
    /// Implementations may deliver records for other roots (shared feeds);
    /// receivers filter.
    async fn subscribe(&self, root_ids: &[RecordId]) -> Result<FeedStream, StoreError>;

    /// Apply upserts and an optional delete atomically.
    async fn commit(
        &self,
        upserts: Vec<Record>,
        delete_id: Option<RecordId>,
    ) -> Result<CommitAck, StoreError>;
}

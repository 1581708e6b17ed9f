//! Replica sync against the store.
//!
//! # Sync Protocol
//!
//! - Activation → full sync (fetch every record under the root, settle)
//! - Change batch → incremental merge into a copy of the current snapshot
//! - Reconnect → full resync, replacing the snapshot wholesale. Incremental
//!   state is never trusted across a feed gap.
//! - Failed resync → `needs_resync` stays set; the next batch retries the
//!   resync before merging
//!
//! ```text
//! +-------------+  full_sync()   +-------------+  root tombstone  +---------+
//! | NotSynced   |--------------->|  Synced     |----------------->| Removed |
//! +-------------+                +-------------+  or NotFound     +---------+
//!                                  |       ^
//!                   resync failed  |       | resync ok
//!                                  v       |
//!                                +-------------+
//!                                | NeedsResync |
//!                                +-------------+
//! ```

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{RecordStore, StoreError};
use cardtree_replica::{CardTree, MergeOutcome, MutableCardTree, Orphan, ReplicaError};
use cardtree_types::{Record, RecordId};

/// Result of a sync operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncResult {
    /// The snapshot was rebuilt from the store.
    FullSync { record_count: usize, dropped: Vec<Orphan> },
    /// A batch altered the snapshot.
    IncrementalMerge { outcome: MergeOutcome },
    /// The batch carried the root's tombstone.
    RootRemoved,
    /// Nothing to publish.
    Skipped { reason: SkipReason },
}

/// Why a sync operation left the snapshot alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Every entry was stale, foreign, or already held.
    NoChange,
    /// No full sync has completed yet.
    NotSynced,
    /// The root is gone; nothing more is merged.
    RootRemoved,
}

/// Error during sync.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// The root no longer exists. Fatal to the session.
    #[error("root not found: {0:?}")]
    NotFound(RecordId),
    /// Store communication failed. Retryable.
    #[error("transport error: {0}")]
    Transport(String),
    /// The store refused the request.
    #[error("store rejected sync: {0}")]
    Rejected(String),
    /// The store handed back a record set that breaks replica invariants.
    #[error("replica invariant violated: {0}")]
    Invariant(#[from] ReplicaError),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SyncError::NotFound(id),
            StoreError::Transport(msg) => SyncError::Transport(msg),
            StoreError::Rejected(msg) => SyncError::Rejected(msg),
        }
    }
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}

/// Fetch every record under `root_id` and build a fresh, settled snapshot.
///
/// Transport errors are returned as-is; retry policy belongs to the caller.
pub async fn full_sync(
    store: &dyn RecordStore,
    root_id: RecordId,
) -> Result<(CardTree, Vec<Orphan>), SyncError> {
    let records = store.records_by_root(root_id).await?;
    let mut tree = MutableCardTree::new(root_id);
    let report = tree.load_full(records)?;
    Ok((tree.freeze()?, report.dropped))
}

/// Owns the current snapshot of one card and decides how each event
/// changes it.
pub struct SyncManager {
    root_id: RecordId,
    store: Arc<dyn RecordStore>,
    current: Option<CardTree>,
    needs_resync: bool,
    removed: bool,
    /// Bumped on every published snapshot.
    version: u64,
}

impl SyncManager {
    /// A manager in the "not synced" state.
    pub fn new(store: Arc<dyn RecordStore>, root_id: RecordId) -> Self {
        Self {
            root_id,
            store,
            current: None,
            needs_resync: false,
            removed: false,
            version: 0,
        }
    }

    pub fn root_id(&self) -> RecordId {
        self.root_id
    }

    /// The latest snapshot, `None` before the first full sync or after removal.
    pub fn current(&self) -> Option<&CardTree> {
        self.current.as_ref()
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Replace held state with the store's current state.
    ///
    /// On a transport failure the previous snapshot is kept and
    /// `needs_resync` is set. `NotFound` marks the root removed.
    pub async fn full_sync(&mut self) -> Result<SyncResult, SyncError> {
        if self.removed {
            return Ok(SyncResult::Skipped { reason: SkipReason::RootRemoved });
        }
        match full_sync(self.store.as_ref(), self.root_id).await {
            Ok((tree, dropped)) => {
                let record_count = tree.len();
                info!(
                    root_id = %self.root_id,
                    records = record_count,
                    dropped = dropped.len(),
                    "full sync complete"
                );
                self.current = Some(tree);
                self.needs_resync = false;
                self.version = self.version.wrapping_add(1);
                Ok(SyncResult::FullSync { record_count, dropped })
            }
            Err(SyncError::NotFound(id)) => {
                warn!("root {id:?} no longer exists");
                self.mark_removed();
                Err(SyncError::NotFound(id))
            }
            Err(e) => {
                warn!("full sync failed, will retry before next batch: {e}");
                self.needs_resync = true;
                Err(e)
            }
        }
    }

    /// Merge one change batch into a copy of the current snapshot.
    ///
    /// The snapshot is only replaced when the batch actually changed
    /// something, so unchanged batches never produce a new publish.
    pub fn apply_incremental(&mut self, batch: &[Record]) -> Result<SyncResult, SyncError> {
        if self.removed {
            return Ok(SyncResult::Skipped { reason: SkipReason::RootRemoved });
        }
        let Some(current) = &self.current else {
            debug!("batch of {} records before first sync, skipping", batch.len());
            return Ok(SyncResult::Skipped { reason: SkipReason::NotSynced });
        };

        let mut copy = current.mutable_copy();
        let outcome = copy.apply_incremental(batch);

        if outcome.root_removed {
            info!("root {:?} removed by incoming tombstone", self.root_id);
            self.mark_removed();
            return Ok(SyncResult::RootRemoved);
        }
        if !outcome.changed {
            return Ok(SyncResult::Skipped { reason: SkipReason::NoChange });
        }

        self.current = Some(copy.freeze()?);
        self.version = self.version.wrapping_add(1);
        Ok(SyncResult::IncrementalMerge { outcome })
    }

    /// Handle a change batch, first retrying a pending resync.
    pub async fn apply_batch(&mut self, batch: &[Record]) -> Result<SyncResult, SyncError> {
        if self.needs_resync {
            info!("retrying pending resync before merging batch");
            self.full_sync().await?;
        }
        self.apply_incremental(batch)
    }

    /// Discard incremental state and resync from the store.
    pub async fn reconcile_on_reconnect(&mut self) -> Result<SyncResult, SyncError> {
        info!(root_id = %self.root_id, "reconnected, discarding incremental state");
        self.needs_resync = true;
        self.full_sync().await
    }

    fn mark_removed(&mut self) {
        self.removed = true;
        self.needs_resync = false;
        self.current = None;
        self.version = self.version.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use cardtree_types::{RecordBuilder, RecordKind};

    /// Helper: a store holding card1 with contents [t1, t2].
    fn create_store() -> (Arc<MemoryStore>, Record, Record, Record) {
        let card = Record::card("card1");
        let t1 = Record::content(card.id, card.id, RecordKind::Text, "t1");
        let t2 = Record::content(card.id, card.id, RecordKind::Text, "t2");
        let store = Arc::new(MemoryStore::with_records([card.clone(), t1.clone(), t2.clone()]));
        (store, card, t1, t2)
    }

    async fn create_synced() -> (SyncManager, Arc<MemoryStore>, Record, Record, Record) {
        let (store, card, t1, t2) = create_store();
        let mut sync = SyncManager::new(store.clone(), card.id);
        sync.full_sync().await.expect("initial sync");
        (sync, store, card, t1, t2)
    }

    fn content_ids(sync: &SyncManager) -> Vec<RecordId> {
        let mut ids: Vec<_> = sync.current().unwrap().contents().map(|r| r.id).collect();
        ids.sort();
        ids
    }

    // =========================================================================
    // Core State Machine Tests
    // =========================================================================

    #[tokio::test]
    async fn test_initial_sync() {
        let (store, card, _, _) = create_store();
        let mut sync = SyncManager::new(store, card.id);
        assert!(sync.current().is_none());

        let result = sync.full_sync().await.unwrap();
        assert_eq!(result, SyncResult::FullSync { record_count: 3, dropped: vec![] });
        assert_eq!(sync.current().unwrap().content_count(), 2);
        assert_eq!(sync.version(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_twice() {
        let (mut sync, _store, _card, t1, t2) = create_synced().await;
        let stone = t2.tombstone(t2.modified_at + 1);

        let first = sync.apply_incremental(std::slice::from_ref(&stone)).unwrap();
        assert!(matches!(first, SyncResult::IncrementalMerge { ref outcome } if outcome.changed));
        assert_eq!(content_ids(&sync), vec![t1.id]);
        let version = sync.version();

        let second = sync.apply_incremental(&[stone]).unwrap();
        assert_eq!(second, SyncResult::Skipped { reason: SkipReason::NoChange });
        assert_eq!(sync.version(), version);
    }

    #[tokio::test]
    async fn test_unchanged_batch_keeps_snapshot_identity() {
        let (mut sync, _store, _card, t1, _) = create_synced().await;
        let before = sync.current().unwrap().clone();
        sync.apply_incremental(&[t1]).unwrap();
        assert!(sync.current().unwrap().same_snapshot(&before));
    }

    #[tokio::test]
    async fn test_batch_before_sync_is_skipped() {
        let (store, card, t1, _) = create_store();
        let mut sync = SyncManager::new(store, card.id);
        let result = sync.apply_incremental(&[t1]).unwrap();
        assert_eq!(result, SyncResult::Skipped { reason: SkipReason::NotSynced });
    }

    #[tokio::test]
    async fn test_root_tombstone_marks_removed() {
        let (mut sync, _store, card, _, _) = create_synced().await;
        let result = sync.apply_incremental(&[card.tombstone(card.modified_at + 1)]).unwrap();
        assert_eq!(result, SyncResult::RootRemoved);
        assert!(sync.is_removed());
        assert!(sync.current().is_none());

        let after = sync.reconcile_on_reconnect().await.unwrap();
        assert_eq!(after, SyncResult::Skipped { reason: SkipReason::RootRemoved });
    }

    #[tokio::test]
    async fn test_reconnect_replaces_wholesale() {
        let (mut sync, store, card, t1, t2) = create_synced().await;

        // Local-only change that the store never saw
        let ghost = Record::content(card.id, card.id, RecordKind::Text, "ghost");
        sync.apply_incremental(std::slice::from_ref(&ghost)).unwrap();

        // Store diverges while disconnected
        let t3 = Record::content(card.id, card.id, RecordKind::Text, "t3");
        store.remove_silently(t1.id);
        store.put(t3.clone());

        sync.reconcile_on_reconnect().await.unwrap();
        let mut expected = vec![t2.id, t3.id];
        expected.sort();
        assert_eq!(content_ids(&sync), expected);
        assert!(!sync.needs_resync());
    }

    #[tokio::test]
    async fn test_failed_resync_is_retried_before_next_batch() {
        let (mut sync, store, card, _, _) = create_synced().await;
        store.fail_next_fetch(StoreError::Transport("socket reset".into()));

        let err = sync.reconcile_on_reconnect().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(sync.needs_resync());
        // Previous snapshot still readable
        assert!(sync.current().is_some());

        let t4 = Record::content(card.id, card.id, RecordKind::Text, "t4");
        store.put(t4.clone());
        let fetches = store.fetch_calls();
        sync.apply_batch(std::slice::from_ref(&t4)).await.unwrap();
        assert_eq!(store.fetch_calls(), fetches + 1);
        assert!(!sync.needs_resync());
        assert!(sync.current().unwrap().contains(&t4.id));
    }

    #[tokio::test]
    async fn test_resync_not_found_is_fatal() {
        let (mut sync, store, card, _, _) = create_synced().await;
        store.remove_silently(card.id);
        let err = sync.reconcile_on_reconnect().await.unwrap_err();
        assert_eq!(err, SyncError::NotFound(card.id));
        assert!(sync.is_removed());
    }

    #[tokio::test]
    async fn test_full_sync_reports_dropped_orphans() {
        let (store, card, _, _) = create_store();
        let orphan = RecordBuilder::new(RecordId::new(), card.id, RecordKind::Text)
            .parent_id(RecordId::new())
            .build();
        store.put(orphan.clone());

        let (tree, dropped) = full_sync(store.as_ref(), card.id).await.unwrap();
        assert!(!tree.contains(&orphan.id));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, orphan.id);
    }

    #[tokio::test]
    async fn test_parentless_content_is_dropped_at_settle() {
        let (store, card, _, _) = create_store();
        let loose = Record::content(card.id, card.id, RecordKind::Comment, "loose");
        store.put(Record { parent_id: None, ..loose });

        let (tree, dropped) = full_sync(store.as_ref(), card.id).await.unwrap();
        assert_eq!(tree.content_count(), 2);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].parent_id, None);
    }
}

//! In-memory [`RecordStore`] with fault injection.
//!
//! Backs the test suite and the inspector binary. Commits are atomic and
//! echo onto every open feed whose subscription covers an affected root,
//! including tombstones. Deleting a root tombstones its whole tree.
//!
//! Fault controls simulate what a real transport does to a client: dropped
//! connections, refused resubscribes, rejected commits, and state that
//! diverges while nobody is listening.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::store::{CommitAck, FeedItem, FeedStream, RecordStore, StoreError};
use cardtree_types::{Record, RecordId, now_millis};

const FEED_CAPACITY: usize = 256;

#[derive(Default)]
struct Inner {
    records: HashMap<RecordId, Record>,
    failing_subscribes: u32,
    failing_fetch: Option<StoreError>,
    failing_commit: Option<StoreError>,
    subscribe_calls: u32,
    fetch_calls: u32,
}

/// Process-local store. Cheap to share behind an `Arc`.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    feed: broadcast::Sender<FeedItem>,
    /// Bumped to sever every open feed.
    epoch: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            feed,
            epoch,
        }
    }

    /// A store pre-seeded with `records` (tombstones are skipped).
    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let store = Self::new();
        store.set_records(records);
        store
    }

    // ── Silent state edits (no feed echo) ───────────────────────────────

    /// Insert or replace a record without notifying any feed.
    pub fn put(&self, record: Record) {
        let mut inner = self.inner.lock();
        if record.deleted {
            inner.records.remove(&record.id);
        } else {
            inner.records.insert(record.id, record);
        }
    }

    /// Replace every record under the affected roots without notifying.
    pub fn set_records(&self, records: impl IntoIterator<Item = Record>) {
        let records: Vec<Record> = records.into_iter().collect();
        let roots: HashSet<RecordId> = records.iter().map(|r| r.root_id).collect();
        let mut inner = self.inner.lock();
        inner.records.retain(|_, r| !roots.contains(&r.root_id));
        for record in records.into_iter().filter(|r| !r.deleted) {
            inner.records.insert(record.id, record);
        }
    }

    /// Remove a record (and its tree, if it is a root) without notifying.
    pub fn remove_silently(&self, id: RecordId) {
        let mut inner = self.inner.lock();
        inner.records.retain(|rid, r| *rid != id && r.root_id != id);
    }

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.inner.lock().records.get(id).cloned()
    }

    /// Live records under `root_id`, root included, in no particular order.
    pub fn snapshot_root(&self, root_id: RecordId) -> Vec<Record> {
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| r.root_id == root_id)
            .cloned()
            .collect()
    }

    /// Ids of every live root record.
    pub fn root_ids(&self) -> Vec<RecordId> {
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| r.is_root())
            .map(|r| r.id)
            .collect()
    }

    // ── Feed controls ───────────────────────────────────────────────────

    /// Deliver a batch verbatim to open feeds without touching stored state.
    /// Simulates duplicate, stale, or foreign deliveries.
    pub fn inject(&self, batch: Vec<Record>) {
        let _ = self.feed.send(FeedItem::Batch(batch));
    }

    /// Tell open feeds they transparently re-established.
    pub fn signal_reconnect(&self) {
        let _ = self.feed.send(FeedItem::Reconnected);
    }

    /// Sever every open feed. Each ends with a transport error.
    pub fn drop_connections(&self) {
        info!("memory store: dropping all feed connections");
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Refuse the next `n` subscribe calls with a transport error.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.inner.lock().failing_subscribes = n;
    }

    pub fn fail_next_fetch(&self, error: StoreError) {
        self.inner.lock().failing_fetch = Some(error);
    }

    pub fn fail_next_commit(&self, error: StoreError) {
        self.inner.lock().failing_commit = Some(error);
    }

    pub fn reject_next_commit(&self, reason: impl Into<String>) {
        self.fail_next_commit(StoreError::Rejected(reason.into()));
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.inner.lock().subscribe_calls
    }

    pub fn fetch_calls(&self) -> u32 {
        self.inner.lock().fetch_calls
    }

    pub fn open_feeds(&self) -> usize {
        self.feed.receiver_count()
    }
}

struct FeedState {
    rx: broadcast::Receiver<FeedItem>,
    epoch: watch::Receiver<u64>,
    roots: HashSet<RecordId>,
    done: bool,
}

fn open_feed(state: FeedState) -> FeedStream {
    let stream = futures::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        loop {
            tokio::select! {
                biased;
                changed = st.epoch.changed() => {
                    st.done = true;
                    return match changed {
                        Ok(()) => Some((Err(StoreError::Transport("connection dropped".into())), st)),
                        Err(_) => None,
                    };
                }
                item = st.rx.recv() => match item {
                    Ok(FeedItem::Batch(records)) => {
                        if records.iter().any(|r| st.roots.contains(&r.root_id)) {
                            return Some((Ok(FeedItem::Batch(records)), st));
                        }
                    }
                    Ok(FeedItem::Reconnected) => return Some((Ok(FeedItem::Reconnected), st)),
                    Err(RecvError::Lagged(n)) => {
                        st.done = true;
                        let err = StoreError::Transport(format!("feed lagged by {n} items"));
                        return Some((Err(err), st));
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    });
    Box::pin(stream)
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn records_by_root(&self, root_id: RecordId) -> Result<Vec<Record>, StoreError> {
        let mut inner = self.inner.lock();
        inner.fetch_calls += 1;
        if let Some(err) = inner.failing_fetch.take() {
            return Err(err);
        }
        if !inner.records.contains_key(&root_id) {
            return Err(StoreError::NotFound(root_id));
        }
        let mut records: Vec<Record> = inner
            .records
            .values()
            .filter(|r| r.root_id == root_id)
            .cloned()
            .collect();
        // Root first, then stable id order
        records.sort_by_key(|r| (!r.is_root(), r.id));
        Ok(records)
    }

    async fn subscribe(&self, root_ids: &[RecordId]) -> Result<FeedStream, StoreError> {
        let mut inner = self.inner.lock();
        inner.subscribe_calls += 1;
        if inner.failing_subscribes > 0 {
            inner.failing_subscribes -= 1;
            return Err(StoreError::Transport("subscribe refused".into()));
        }
        debug!("memory store: feed opened for {} roots", root_ids.len());
        Ok(open_feed(FeedState {
            rx: self.feed.subscribe(),
            epoch: self.epoch.subscribe(),
            roots: root_ids.iter().copied().collect(),
            done: false,
        }))
    }

    async fn commit(
        &self,
        upserts: Vec<Record>,
        delete_id: Option<RecordId>,
    ) -> Result<CommitAck, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.failing_commit.take() {
            return Err(err);
        }

        // Validate everything before touching state
        if let Some(id) = delete_id {
            if !inner.records.contains_key(&id) {
                return Err(StoreError::Rejected(format!("delete target {id} does not exist")));
            }
        }
        for record in &upserts {
            if record.deleted {
                return Err(StoreError::Rejected(format!(
                    "upsert {} carries a tombstone; use delete",
                    record.id
                )));
            }
            let root_known = record.is_root()
                || inner.records.contains_key(&record.root_id)
                || upserts.iter().any(|u| u.id == record.root_id);
            if !root_known {
                return Err(StoreError::Rejected(format!(
                    "record {} references unknown root {}",
                    record.id, record.root_id
                )));
            }
        }

        let mut echo = Vec::with_capacity(upserts.len() + 1);
        for record in upserts.iter().cloned() {
            inner.records.insert(record.id, record.clone());
            echo.push(record);
        }

        let mut deleted = 0;
        if let Some(id) = delete_id {
            let doomed: Vec<RecordId> = inner
                .records
                .values()
                .filter(|r| r.id == id || r.root_id == id)
                .map(|r| r.id)
                .collect();
            // Target last so receivers see contents go before their root
            let (targets, cascade): (Vec<_>, Vec<_>) = doomed.into_iter().partition(|d| *d == id);
            for doomed_id in cascade.into_iter().chain(targets) {
                if let Some(record) = inner.records.remove(&doomed_id) {
                    let stamp = now_millis().max(record.modified_at + 1);
                    echo.push(record.tombstone(stamp));
                    deleted += 1;
                }
            }
        }

        let ack = CommitAck { upserted: upserts.len(), deleted };
        debug!(upserted = ack.upserted, deleted = ack.deleted, "memory store: commit");
        if !echo.is_empty() {
            let _ = self.feed.send(FeedItem::Batch(echo));
        }
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardtree_types::RecordKind;
    use futures::StreamExt;

    fn create_card_with_contents() -> (Record, Record, Record) {
        let card = Record::card("card1");
        let t1 = Record::content(card.id, card.id, RecordKind::Text, "t1");
        let t2 = Record::content(card.id, card.id, RecordKind::Text, "t2");
        (card, t1, t2)
    }

    #[tokio::test]
    async fn test_fetch_root_first() {
        let (card, t1, t2) = create_card_with_contents();
        let store = MemoryStore::with_records([t2, t1, card.clone()]);
        let records = store.records_by_root(card.id).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].id, card.id);
    }

    #[tokio::test]
    async fn test_fetch_missing_root_is_not_found() {
        let store = MemoryStore::new();
        let id = RecordId::new();
        assert_eq!(store.records_by_root(id).await, Err(StoreError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_commit_echoes_to_feed() {
        let (card, t1, _) = create_card_with_contents();
        let store = MemoryStore::with_records([card.clone()]);
        let mut feed = store.subscribe(&[card.id]).await.unwrap();

        store.commit(vec![t1.clone()], None).await.unwrap();
        let item = feed.next().await.unwrap().unwrap();
        assert_eq!(item, FeedItem::Batch(vec![t1]));
    }

    #[tokio::test]
    async fn test_delete_root_cascades_tombstones() {
        let (card, t1, t2) = create_card_with_contents();
        let store = MemoryStore::with_records([card.clone(), t1, t2]);
        let mut feed = store.subscribe(&[card.id]).await.unwrap();

        let ack = store.commit(vec![], Some(card.id)).await.unwrap();
        assert_eq!(ack.deleted, 3);
        assert!(store.snapshot_root(card.id).is_empty());

        let Some(Ok(FeedItem::Batch(batch))) = feed.next().await else {
            panic!("expected a tombstone batch");
        };
        assert!(batch.iter().all(|r| r.deleted));
        assert_eq!(batch.last().map(|r| r.id), Some(card.id));
    }

    #[tokio::test]
    async fn test_rejected_commit_applies_nothing() {
        let (card, t1, _) = create_card_with_contents();
        let store = MemoryStore::with_records([card.clone()]);
        store.reject_next_commit("read-only board");
        let err = store.commit(vec![t1.clone()], None).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert!(store.get(&t1.id).is_none());

        // Unknown root is refused wholesale
        let stray = Record::content(RecordId::new(), RecordId::new(), RecordKind::Text, "x");
        let err = store.commit(vec![t1.clone(), stray], None).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert!(store.get(&t1.id).is_none());
    }

    #[tokio::test]
    async fn test_drop_connections_ends_feeds() {
        let (card, _, _) = create_card_with_contents();
        let store = MemoryStore::with_records([card.clone()]);
        let mut feed = store.subscribe(&[card.id]).await.unwrap();

        store.drop_connections();
        assert!(matches!(feed.next().await, Some(Err(StoreError::Transport(_)))));
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_feed_skips_unrelated_roots() {
        let (card, _, _) = create_card_with_contents();
        let other = Record::card("other");
        let store = MemoryStore::with_records([card.clone()]);
        let mut feed = store.subscribe(&[card.id]).await.unwrap();

        store.commit(vec![other], None).await.unwrap();
        store.signal_reconnect();
        assert_eq!(feed.next().await, Some(Ok(FeedItem::Reconnected)));
    }

    #[tokio::test]
    async fn test_failing_subscribes_count_down() {
        let store = MemoryStore::new();
        store.fail_next_subscribes(2);
        assert!(store.subscribe(&[]).await.is_err());
        assert!(store.subscribe(&[]).await.is_err());
        assert!(store.subscribe(&[]).await.is_ok());
        assert_eq!(store.subscribe_calls(), 3);
    }
}

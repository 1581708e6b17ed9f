//! Transactional command execution against the store.
//!
//! A [`Transaction`] is an ordered set of upserts plus at most one delete,
//! with a description for the undo log and two optional continuations.
//! [`Mutator::apply`] commits it atomically; exactly one continuation runs
//! before `apply` returns: `on_success` after the store acknowledges,
//! `on_undo` when it refuses or the transport fails.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::constants::DEFAULT_HISTORY_LIMIT;
use crate::store::{CommitAck, RecordStore, StoreError};
use cardtree_types::{Record, RecordId, now_millis};

/// A caller-supplied continuation.
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// Errors from applying a transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutatorError {
    /// Nothing to commit. No continuation runs.
    #[error("transaction '{0}' has no upserts and no delete")]
    Empty(String),
    /// The store refused the transaction; nothing was applied.
    #[error("transaction rejected: {0}")]
    Rejected(String),
    /// The delete target does not exist at the store.
    #[error("record not found: {0:?}")]
    NotFound(RecordId),
    /// Communication failure; the store applied nothing.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<StoreError> for MutatorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => MutatorError::NotFound(id),
            StoreError::Transport(msg) => MutatorError::Transport(msg),
            StoreError::Rejected(msg) => MutatorError::Rejected(msg),
        }
    }
}

/// An atomic, describable set of record changes.
pub struct Transaction {
    description: String,
    upserts: Vec<Record>,
    delete: Option<RecordId>,
    on_success: Option<Continuation>,
    on_undo: Option<Continuation>,
}

impl Transaction {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            upserts: Vec::new(),
            delete: None,
            on_success: None,
            on_undo: None,
        }
    }

    pub fn upsert(mut self, record: Record) -> Self {
        self.upserts.push(record);
        self
    }

    pub fn upserts(mut self, records: impl IntoIterator<Item = Record>) -> Self {
        self.upserts.extend(records);
        self
    }

    /// Tombstone `id`. A transaction carries at most one delete; the last
    /// call wins.
    pub fn delete(mut self, id: RecordId) -> Self {
        self.delete = Some(id);
        self
    }

    pub fn on_success(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_undo(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_undo = Some(Box::new(f));
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.delete.is_none()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("description", &self.description)
            .field("upserts", &self.upserts.len())
            .field("delete", &self.delete)
            .field("on_success", &self.on_success.is_some())
            .field("on_undo", &self.on_undo.is_some())
            .finish()
    }
}

/// One applied transaction, for undo-log display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub description: String,
    pub committed_at: u64,
    pub upserted: usize,
    pub deleted: usize,
}

/// Executes transactions and keeps a bounded log of what landed.
pub struct Mutator {
    store: Arc<dyn RecordStore>,
    history: Mutex<VecDeque<HistoryEntry>>,
    history_limit: usize,
    /// Last `modified_at` handed out.
    clock: AtomicU64,
}

impl Mutator {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::with_history_limit(store, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(store: Arc<dyn RecordStore>, history_limit: usize) -> Self {
        Self {
            store,
            history: Mutex::new(VecDeque::new()),
            history_limit,
            clock: AtomicU64::new(0),
        }
    }

    /// Commit `tx` atomically and run the matching continuation.
    ///
    /// Every upsert is restamped with a revision newer than both the wall
    /// clock and its previous `modified_at`, so its echo through the change
    /// feed is never discarded as stale.
    pub async fn apply(&self, tx: Transaction) -> Result<CommitAck, MutatorError> {
        let Transaction { description, mut upserts, delete, on_success, on_undo } = tx;
        if upserts.is_empty() && delete.is_none() {
            return Err(MutatorError::Empty(description));
        }

        let floor = upserts.iter().map(|r| r.modified_at).max().unwrap_or(0);
        let stamp = self.next_stamp(floor);
        for record in &mut upserts {
            record.modified_at = stamp;
        }

        debug!(
            description = %description,
            upserts = upserts.len(),
            delete = ?delete,
            "applying transaction"
        );
        match self.store.commit(upserts, delete).await {
            Ok(ack) => {
                info!(description = %description, "transaction committed");
                self.record(HistoryEntry {
                    description,
                    committed_at: stamp,
                    upserted: ack.upserted,
                    deleted: ack.deleted,
                });
                if let Some(f) = on_success {
                    f();
                }
                Ok(ack)
            }
            Err(e) => {
                warn!(description = %description, "transaction failed: {e}");
                if let Some(f) = on_undo {
                    f();
                }
                Err(e.into())
            }
        }
    }

    /// Tombstone a single record. No continuations.
    pub async fn delete(
        &self,
        record: &Record,
        description: impl Into<String>,
    ) -> Result<CommitAck, MutatorError> {
        self.apply(Transaction::new(description).delete(record.id)).await
    }

    /// Bulk upsert with continuations.
    pub async fn insert(
        &self,
        records: Vec<Record>,
        description: impl Into<String>,
        on_success: impl FnOnce() + Send + 'static,
        on_undo: impl FnOnce() + Send + 'static,
    ) -> Result<CommitAck, MutatorError> {
        let tx = Transaction::new(description)
            .upserts(records)
            .on_success(on_success)
            .on_undo(on_undo);
        self.apply(tx).await
    }

    /// Applied transactions, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().iter().cloned().collect()
    }

    fn record(&self, entry: HistoryEntry) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(entry);
    }

    /// Next revision: strictly after the last one issued and after `floor`.
    fn next_stamp(&self, floor: u64) -> u64 {
        let now = now_millis();
        let mut issued = 0;
        let _ = self.clock.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            issued = now.max(last + 1).max(floor + 1);
            Some(issued)
        });
        issued
    }
}

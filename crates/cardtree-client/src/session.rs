//! Card session: the controller behind one open card.
//!
//! ```text
//!   activate()                     processing task (one per session)
//!   ┌──────────────┐  spawn   ┌───────────────────────────────────────┐
//!   │ full sync    │ ───────▶ │ ChangeListener::drive(SessionHandler) │
//!   │ open listener│          │   Changed    → apply_batch → publish  │
//!   └──────────────┘          │   Reconnected→ resync      → publish  │
//!                             └───────────────────────────────────────┘
//!          ▲                        │ watch<SnapshotState>   │ mpsc<SessionError>
//!          │                        ▼                        ▼
//!   request_delete()           subscribe_snapshots()     next_error()
//!   request_template_copy()
//! ```
//!
//! The session owns its replica exclusively. Readers get immutable
//! [`CardTree`] snapshots through a watch channel; every change publishes a
//! new snapshot instead of editing the old one.
//!
//! Deactivation is a hard cutoff: [`CardSession::deactivate`] cancels the
//! listener, then waits for the processing task to exit. Every publish is
//! guarded by the session's cancellation token, so once `deactivate`
//! returns nothing more is published.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::listener::{ChangeHandler, ChangeListener, Flow, ListenerState};
use crate::mutator::{HistoryEntry, Mutator, MutatorError};
use crate::store::RecordStore;
use crate::sync::{SyncError, SyncManager, SyncResult};
use cardtree_replica::{CardTree, Orphan, ReplicaError};
use cardtree_types::{Record, RecordId, SessionId};

/// What readers see.
///
/// A session only exists once its first full sync has landed, so there is no
/// "not yet synced" state to observe.
#[derive(Debug, Clone)]
pub enum SnapshotState {
    Ready(CardTree),
    /// The card was deleted. Terminal.
    Removed { root_id: RecordId },
}

impl SnapshotState {
    pub fn tree(&self) -> Option<&CardTree> {
        match self {
            SnapshotState::Ready(tree) => Some(tree),
            _ => None,
        }
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, SnapshotState::Removed { .. })
    }
}

/// Errors surfaced to the presentation layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The card no longer exists. The session has stopped listening.
    #[error("card {0:?} no longer exists")]
    RootRemoved(RecordId),
    #[error("transport error: {0}")]
    Transport(String),
    /// Identity or shape violation in data from the store.
    #[error("invariant violation: {0}")]
    Invariant(#[from] ReplicaError),
    #[error("command rejected: {0}")]
    CommandRejected(String),
    #[error("command unavailable: {0}")]
    CommandUnavailable(&'static str),
    #[error("card not synced yet")]
    NotSynced,
    #[error("session closed")]
    Closed,
}

impl From<SyncError> for SessionError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::NotFound(id) => SessionError::RootRemoved(id),
            SyncError::Transport(msg) | SyncError::Rejected(msg) => SessionError::Transport(msg),
            SyncError::Invariant(e) => SessionError::Invariant(e),
        }
    }
}

impl From<MutatorError> for SessionError {
    fn from(e: MutatorError) -> Self {
        match e {
            MutatorError::Rejected(msg) => SessionError::CommandRejected(msg),
            MutatorError::Empty(desc) => SessionError::CommandRejected(format!("empty transaction '{desc}'")),
            MutatorError::NotFound(id) => SessionError::RootRemoved(id),
            MutatorError::Transport(msg) => SessionError::Transport(msg),
        }
    }
}

/// Listener callbacks for one session.
struct SessionHandler {
    id: SessionId,
    sync: SyncManager,
    snapshots: watch::Sender<SnapshotState>,
    errors: mpsc::Sender<SessionError>,
    cancel: CancellationToken,
}

impl SessionHandler {
    /// Publish if the session is still live.
    fn publish(&self, state: SnapshotState) -> bool {
        if self.cancel.is_cancelled() {
            debug!(session = %self.id, "session closed, dropping publish");
            return false;
        }
        self.snapshots.send_replace(state);
        true
    }

    fn publish_current(&self) {
        if let Some(tree) = self.sync.current() {
            self.publish(SnapshotState::Ready(tree.clone()));
        }
    }

    fn report(&self, error: SessionError) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.errors.try_send(error).is_err() {
            warn!(session = %self.id, "session error channel full, dropping error");
        }
    }

    fn report_orphans(&self, dropped: Vec<Orphan>) {
        for orphan in dropped {
            self.report(SessionError::Invariant(orphan.into_error()));
        }
    }

    /// Root is gone: publish the terminal state and stop listening.
    fn root_removed(&self) -> Flow {
        let root_id = self.sync.root_id();
        info!(session = %self.id, "card {root_id:?} removed, closing session listener");
        if self.publish(SnapshotState::Removed { root_id }) {
            self.report(SessionError::RootRemoved(root_id));
        }
        Flow::Stop
    }

    /// Common tail for both event kinds.
    fn settle(&self, before: u64, result: Result<SyncResult, SyncError>) -> Result<Flow, SessionError> {
        match result {
            Ok(SyncResult::RootRemoved) | Err(SyncError::NotFound(_)) => Ok(self.root_removed()),
            Ok(other) => {
                if let SyncResult::FullSync { dropped, .. } = other {
                    self.report_orphans(dropped);
                }
                if self.sync.version() != before {
                    self.publish_current();
                }
                Ok(Flow::Continue)
            }
            Err(e) => {
                // A resync may have landed before the failure
                if self.sync.version() != before {
                    self.publish_current();
                }
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl ChangeHandler for SessionHandler {
    type Error = SessionError;

    async fn on_changed(&mut self, batch: Vec<Record>) -> Result<Flow, SessionError> {
        let before = self.sync.version();
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Flow::Stop),
            result = self.sync.apply_batch(&batch) => result,
        };
        self.settle(before, result)
    }

    async fn on_reconnect(&mut self) -> Result<Flow, SessionError> {
        let before = self.sync.version();
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Flow::Stop),
            result = self.sync.reconcile_on_reconnect() => result,
        };
        self.settle(before, result)
    }
}

/// One open card.
pub struct CardSession {
    id: SessionId,
    root_id: RecordId,
    config: ClientConfig,
    mutator: Mutator,
    snapshots: watch::Receiver<SnapshotState>,
    listener_state: watch::Receiver<ListenerState>,
    errors: mpsc::Receiver<SessionError>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CardSession {
    /// Full sync, then start listening for changes.
    ///
    /// Fails without leaving anything running if the card cannot be
    /// fetched.
    pub async fn activate(
        store: Arc<dyn RecordStore>,
        root_id: RecordId,
        config: ClientConfig,
    ) -> Result<Self, SessionError> {
        let id = SessionId::new();
        let mut sync = SyncManager::new(store.clone(), root_id);
        let dropped = match sync.full_sync().await? {
            SyncResult::FullSync { dropped, .. } => dropped,
            _ => Vec::new(),
        };
        let tree = sync.current().cloned().ok_or(SessionError::NotSynced)?;
        info!(session = %id, root_id = %root_id, records = tree.len(), "card session activated");

        let (snapshot_tx, snapshots) = watch::channel(SnapshotState::Ready(tree));
        let (error_tx, errors) = mpsc::channel(config.error_capacity.max(1));
        let cancel = CancellationToken::new();

        // The snapshot predates the subscription: resync once the feed is up
        let listener = ChangeListener::open_after_fetch(
            store.clone(),
            vec![root_id],
            config.listener.clone(),
            cancel.child_token(),
        );
        let listener_state = listener.subscribe_state();

        let handler = SessionHandler {
            id,
            sync,
            snapshots: snapshot_tx,
            errors: error_tx.clone(),
            cancel: cancel.clone(),
        };
        handler.report_orphans(dropped);

        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            if let Some(e) = listener.drive(handler, error_tx.clone()).await {
                if !task_cancel.is_cancelled() {
                    error!(session = %id, "change listener gave up: {e}");
                    let _ = error_tx.try_send(SessionError::Transport(e.to_string()));
                }
            }
            debug!(session = %id, "session processing task exited");
        });

        Ok(Self {
            id,
            root_id,
            mutator: Mutator::with_history_limit(store, config.history_limit),
            config,
            snapshots,
            listener_state,
            errors,
            cancel,
            task: Some(task),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn root_id(&self) -> RecordId {
        self.root_id
    }

    /// The latest published state.
    pub fn current_snapshot(&self) -> SnapshotState {
        self.snapshots.borrow().clone()
    }

    pub fn current_tree(&self) -> Option<CardTree> {
        self.snapshots.borrow().tree().cloned()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<SnapshotState> {
        self.snapshots.clone()
    }

    /// Whether the open card is a template (drives the "editing a
    /// template" banner). `false` when no snapshot is ready.
    pub fn is_template(&self) -> bool {
        self.snapshots.borrow().tree().is_some_and(|t| t.is_template())
    }

    pub fn listener_state(&self) -> ListenerState {
        self.listener_state.borrow().clone()
    }

    pub fn subscribe_listener_state(&self) -> watch::Receiver<ListenerState> {
        self.listener_state.clone()
    }

    /// Next error from the processing task. `None` once the task has
    /// exited and everything buffered was read.
    pub async fn next_error(&mut self) -> Option<SessionError> {
        self.errors.recv().await
    }

    pub fn try_next_error(&mut self) -> Option<SessionError> {
        self.errors.try_recv().ok()
    }

    /// Applied transactions, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.mutator.history()
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn ready_tree(&self) -> Result<CardTree, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Closed);
        }
        match &*self.snapshots.borrow() {
            SnapshotState::Ready(tree) => Ok(tree.clone()),
            SnapshotState::Removed { root_id } => Err(SessionError::RootRemoved(*root_id)),
        }
    }

    /// Delete the open card. `on_closed` runs once the store acknowledges.
    ///
    /// The deletion comes back through the change feed as a tombstone, which
    /// moves the session to [`SnapshotState::Removed`].
    pub async fn request_delete(
        &self,
        on_closed: impl FnOnce() + Send + 'static,
    ) -> Result<(), SessionError> {
        let tree = self.ready_tree()?;
        info!(session = %self.id, "deleting card {:?}", tree.root_id());
        self.mutator.delete(tree.root(), "delete card").await?;
        on_closed();
        Ok(())
    }

    /// Duplicate the open card as a new template.
    ///
    /// `show_card` is called with the new card's id on success and with
    /// `None` if the insert is undone. Unavailable when the open card is
    /// itself a template.
    pub async fn request_template_copy(
        &self,
        show_card: impl Fn(Option<RecordId>) + Send + Sync + 'static,
    ) -> Result<RecordId, SessionError> {
        let tree = self.ready_tree()?;
        if tree.is_template() {
            return Err(SessionError::CommandUnavailable("card is already a template"));
        }

        let template = tree.template_copy_titled(&self.config.template_title);
        let new_id = template.root_id();
        let records = template.records().cloned().collect();
        info!(session = %self.id, "creating template {new_id:?} from card {:?}", tree.root_id());

        let show_card = Arc::new(show_card);
        let show_new = show_card.clone();
        self.mutator
            .insert(
                records,
                "create template from card",
                move || (*show_new)(Some(new_id)),
                move || (*show_card)(None),
            )
            .await?;
        Ok(new_id)
    }

    /// Stop listening. On return no further snapshot or error is published.
    pub async fn deactivate(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(session = %self.id, "session processing task panicked: {e}");
                }
            }
        }
        info!(session = %self.id, "card session deactivated");
    }
}

impl Drop for CardSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;
    use crate::memory_store::MemoryStore;
    use cardtree_types::RecordKind;
    use std::time::Duration;

    fn create_config() -> ClientConfig {
        ClientConfig {
            listener: ListenerConfig {
                backoff_initial_ms: 1,
                backoff_max_ms: 5,
                jitter: 0.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn create_session(records: Vec<Record>) -> (CardSession, Arc<MemoryStore>) {
        let root = records[0].id;
        let store = Arc::new(MemoryStore::with_records(records));
        let session = CardSession::activate(store.clone(), root, create_config())
            .await
            .expect("activate");
        (session, store)
    }

    async fn wait_for_open(session: &CardSession) {
        let mut rx = session.subscribe_listener_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.is_open()))
            .await
            .expect("listener open timeout")
            .expect("listener state closed");
    }

    #[tokio::test]
    async fn test_activate_publishes_ready_snapshot() {
        let card = Record::card("card1");
        let t1 = Record::content(card.id, card.id, RecordKind::Text, "t1");
        let (mut session, _store) = create_session(vec![card.clone(), t1]).await;

        let tree = session.current_tree().expect("ready");
        assert_eq!(tree.root_id(), card.id);
        assert_eq!(tree.content_count(), 1);
        assert!(!session.is_template());
        session.deactivate().await;
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_activate_missing_card_fails() {
        let store = Arc::new(MemoryStore::new());
        let missing = RecordId::new();
        let result = CardSession::activate(store, missing, create_config()).await;
        assert!(matches!(result, Err(SessionError::RootRemoved(id)) if id == missing));
    }

    #[tokio::test]
    async fn test_template_command_unavailable_on_templates() {
        let mut card = Record::card("tmpl");
        card.is_template = true;
        let (mut session, store) = create_session(vec![card]).await;
        assert!(session.is_template());

        let err = session.request_template_copy(|_| {}).await.unwrap_err();
        assert!(matches!(err, SessionError::CommandUnavailable(_)));
        assert_eq!(store.root_ids().len(), 1);
        session.deactivate().await;
    }

    #[tokio::test]
    async fn test_rejected_delete_surfaces_and_keeps_card() {
        let card = Record::card("card1");
        let (mut session, store) = create_session(vec![card.clone()]).await;
        store.reject_next_commit("locked");

        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = closed.clone();
        let err = session
            .request_delete(move || flag.store(true, std::sync::atomic::Ordering::SeqCst))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::CommandRejected("locked".into()));
        assert!(!closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(store.get(&card.id).is_some());
        session.deactivate().await;
    }

    #[tokio::test]
    async fn test_commands_after_deactivate_are_refused() {
        let card = Record::card("card1");
        let (mut session, _store) = create_session(vec![card]).await;
        wait_for_open(&session).await;
        session.deactivate().await;

        assert_eq!(session.request_delete(|| {}).await, Err(SessionError::Closed));
        assert_eq!(session.listener_state(), ListenerState::Closed);
        assert_eq!(session.next_error().await, None);
    }
}

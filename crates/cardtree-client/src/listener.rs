//! Change listener: a self-healing subscription to the store's change feed.
//!
//! ```text
//!            open()
//!   Closed ─────────▶ Opening ──subscribe ok──▶ Open
//!     ▲                 ▲  │                     │
//!     │     backoff     │  │ subscribe failed    │ feed error / end
//!     │                 │  ▼                     ▼
//!     └── max_attempts ─ Disconnected ◀──────────┘
//!     └── close() from any state
//! ```
//!
//! The pump task owns the feed and forwards typed [`ChangeEvent`]s over a
//! bounded channel to exactly one consumer. After any re-establishment it
//! emits [`ChangeEvent::Reconnected`] before the first batch of the new
//! connection, so a consumer that resyncs on reconnect never merges a batch
//! on top of pre-gap state. A consumer whose state was fetched before the
//! listener existed opens with [`ChangeListener::open_after_fetch`], which
//! treats the first establishment as a reconnect too.
//!
//! A connection only counts as healthy once it delivers something. A feed
//! that is accepted and then lost straight away backs off like a refused
//! subscribe and counts against `max_attempts`.
//!
//! Cancellation is a hard cutoff: once [`ChangeListener::close`] returns, the
//! pump has exited and buffered events are discarded.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ListenerConfig;
use crate::store::{FeedItem, RecordStore, StoreError};
use cardtree_types::{Record, RecordId};

/// Listener lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Closed,
    /// Establishing a subscription. `attempt` counts consecutive tries.
    Opening { attempt: u32 },
    Open,
    /// Waiting to retry after a failure.
    Disconnected { attempt: u32, reason: String },
}

impl ListenerState {
    pub fn is_open(&self) -> bool {
        matches!(self, ListenerState::Open)
    }
}

/// What the listener delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// A batch touching at least one subscribed root, verbatim.
    Changed(Vec<Record>),
    /// The feed came back after a gap; held state may be stale.
    Reconnected,
}

/// Whether a handler wants more events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Callback-style consumer for [`ChangeListener::drive`].
#[async_trait]
pub trait ChangeHandler: Send {
    type Error: std::error::Error + Send + 'static;

    async fn on_changed(&mut self, batch: Vec<Record>) -> Result<Flow, Self::Error>;

    async fn on_reconnect(&mut self) -> Result<Flow, Self::Error>;
}

/// Handle to a running subscription.
pub struct ChangeListener {
    root_ids: Vec<RecordId>,
    events: mpsc::Receiver<ChangeEvent>,
    state: watch::Receiver<ListenerState>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<Option<StoreError>>>,
}

impl ChangeListener {
    /// Start listening for changes under `root_ids`.
    ///
    /// Returns immediately in `Opening`; the pump establishes the feed in the
    /// background. Cancelling `cancel` (or any parent of it) closes the
    /// listener.
    pub fn open(
        store: Arc<dyn RecordStore>,
        root_ids: Vec<RecordId>,
        config: ListenerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self::spawn(store, root_ids, config, cancel, false)
    }

    /// Like [`ChangeListener::open`], but also emits
    /// [`ChangeEvent::Reconnected`] when the feed first opens.
    ///
    /// For consumers holding state fetched before this call: anything
    /// committed between that fetch and the subscription never reaches the
    /// feed, so the consumer must resync once the feed is up.
    pub fn open_after_fetch(
        store: Arc<dyn RecordStore>,
        root_ids: Vec<RecordId>,
        config: ListenerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self::spawn(store, root_ids, config, cancel, true)
    }

    fn spawn(
        store: Arc<dyn RecordStore>,
        root_ids: Vec<RecordId>,
        config: ListenerConfig,
        cancel: CancellationToken,
        catch_up: bool,
    ) -> Self {
        let (event_tx, events) = mpsc::channel(config.event_capacity.max(1));
        let (state_tx, state) = watch::channel(ListenerState::Opening { attempt: 1 });

        let pump = Pump {
            store,
            root_ids: root_ids.clone(),
            config,
            events: event_tx,
            state: state_tx,
            cancel: cancel.clone(),
            catch_up,
        };
        let handle = tokio::spawn(pump.run());
        info!("change listener opened for {} roots", root_ids.len());

        Self {
            root_ids,
            events,
            state,
            cancel,
            pump: Some(handle),
        }
    }

    pub fn root_ids(&self) -> &[RecordId] {
        &self.root_ids
    }

    pub fn state(&self) -> ListenerState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.pump.is_none()
    }

    /// Next event, in arrival order. `None` once closed.
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Close from any state.
    ///
    /// On return the pump has stopped and anything still buffered has been
    /// dropped. Returns the transport error that exhausted the retry budget,
    /// if that is why the listener ended.
    pub async fn close(&mut self) -> Option<StoreError> {
        self.cancel.cancel();
        self.events.close();
        let mut discarded = 0usize;
        while self.events.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!("change listener closed, discarded {discarded} undelivered events");
        }

        let handle = self.pump.take()?;
        match handle.await {
            Ok(last_error) => last_error,
            Err(e) if e.is_cancelled() => None,
            Err(e) => {
                error!("change listener pump panicked: {e}");
                Some(StoreError::Transport(format!("listener task failed: {e}")))
            }
        }
    }

    /// Feed every event to `handler`, one at a time, until the listener
    /// closes or the handler returns [`Flow::Stop`].
    ///
    /// Handler errors go to `errors` and do not stop delivery. Connectivity
    /// problems never appear there; they show up in [`ListenerState`].
    pub async fn drive<H: ChangeHandler>(
        mut self,
        mut handler: H,
        errors: mpsc::Sender<H::Error>,
    ) -> Option<StoreError> {
        while let Some(event) = self.next_event().await {
            let result = match event {
                ChangeEvent::Changed(batch) => handler.on_changed(batch).await,
                ChangeEvent::Reconnected => handler.on_reconnect().await,
            };
            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(e) => {
                    warn!("change handler failed: {e}");
                    if errors.try_send(e).is_err() {
                        warn!("handler error channel full or closed, dropping error");
                    }
                }
            }
        }
        self.close().await
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.pump.take() {
            handle.abort();
        }
    }
}

struct Pump {
    store: Arc<dyn RecordStore>,
    root_ids: Vec<RecordId>,
    config: ListenerConfig,
    events: mpsc::Sender<ChangeEvent>,
    state: watch::Sender<ListenerState>,
    cancel: CancellationToken,
    /// Announce the first establishment as a reconnect.
    catch_up: bool,
}

impl Pump {
    async fn run(self) -> Option<StoreError> {
        let roots: HashSet<RecordId> = self.root_ids.iter().copied().collect();
        let mut announce_open = self.catch_up;
        let mut attempt: u32 = 0;
        let mut last_error = None;

        'connect: loop {
            attempt += 1;
            self.state.send_replace(ListenerState::Opening { attempt });

            let subscribed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break 'connect,
                result = self.store.subscribe(&self.root_ids) => result,
            };

            let mut feed = match subscribed {
                Ok(feed) => feed,
                Err(e) => {
                    warn!(attempt, "subscribe failed: {e}");
                    if let Some(max) = self.config.max_attempts {
                        if attempt >= max {
                            error!("giving up after {attempt} subscribe attempts");
                            last_error = Some(e);
                            break 'connect;
                        }
                    }
                    self.state.send_replace(ListenerState::Disconnected {
                        attempt,
                        reason: e.to_string(),
                    });
                    let delay = self.config.delay_for(attempt);
                    trace!("retrying subscribe in {delay:?}");
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break 'connect,
                        _ = tokio::time::sleep(delay) => continue 'connect,
                    }
                }
            };

            self.state.send_replace(ListenerState::Open);
            if announce_open {
                info!("change feed established, announcing reconnect");
                if !self.deliver(ChangeEvent::Reconnected).await {
                    break 'connect;
                }
            }
            announce_open = true;

            let reason = loop {
                let item = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break 'connect,
                    item = feed.next() => item,
                };
                if matches!(item, Some(Ok(_))) {
                    attempt = 0;
                }
                match item {
                    Some(Ok(FeedItem::Batch(batch))) => {
                        if !batch.iter().any(|r| roots.contains(&r.root_id)) {
                            trace!("skipping batch of {} unrelated records", batch.len());
                            continue;
                        }
                        if !self.deliver(ChangeEvent::Changed(batch)).await {
                            break 'connect;
                        }
                    }
                    Some(Ok(FeedItem::Reconnected)) => {
                        if !self.deliver(ChangeEvent::Reconnected).await {
                            break 'connect;
                        }
                    }
                    Some(Err(e)) => break e,
                    None => break StoreError::Transport("feed ended".to_string()),
                };
            };

            warn!(attempt, "change feed lost: {reason}");
            if attempt > 0 {
                // Lost before delivering anything: a failed attempt
                if let Some(max) = self.config.max_attempts {
                    if attempt >= max {
                        error!("giving up after {attempt} short-lived connections");
                        last_error = Some(reason);
                        break 'connect;
                    }
                }
            }
            self.state.send_replace(ListenerState::Disconnected {
                attempt,
                reason: reason.to_string(),
            });
            let delay = self.config.delay_for(attempt.max(1));
            trace!("resubscribing in {delay:?}");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break 'connect,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(ListenerState::Closed);
        debug!("change listener pump exited");
        last_error
    }

    /// Forward one event. `false` when the listener is closing.
    async fn deliver(&self, event: ChangeEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }
}

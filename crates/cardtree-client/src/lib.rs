//! Card session client for cardtree.
//!
//! Keeps a local replica of one card in step with a remote store:
//! full sync on activation, incremental merge of change batches, a full
//! resync after every feed reconnect, and transactional commands (delete,
//! duplicate-as-template) with success/undo continuations.
//!
//! ```text
//!   RecordStore (remote, authoritative)
//!     │ records_by_root        │ subscribe          ▲ commit
//!     ▼                        ▼                    │
//!   SyncManager ◀──events── ChangeListener       Mutator
//!     │                                             ▲
//!     └─────────────── CardSession ─────────────────┘
//!                         │ watch<SnapshotState>
//!                         ▼
//!                  presentation layer
//! ```
//!
//! The store is reached only through [`RecordStore`]. [`MemoryStore`] is a
//! complete in-process implementation with fault injection for tests.

pub mod config;
pub mod constants;
pub mod listener;
pub mod memory_store;
pub mod mutator;
pub mod session;
pub mod store;
pub mod sync;

pub use config::{ClientConfig, ConfigError, ListenerConfig};
pub use listener::{ChangeEvent, ChangeHandler, ChangeListener, Flow, ListenerState};
pub use memory_store::MemoryStore;
pub use mutator::{Continuation, HistoryEntry, Mutator, MutatorError, Transaction};
pub use session::{CardSession, SessionError, SnapshotState};
pub use store::{CommitAck, FeedItem, FeedStream, RecordStore, StoreError};
pub use sync::{SkipReason, SyncError, SyncManager, SyncResult, full_sync};

pub use cardtree_replica::{CardTree, MergeOutcome, MutableCardTree, ReplicaError, TreeIndex};
pub use cardtree_types::{Record, RecordBuilder, RecordId, RecordKind, SessionId};

//! Card tree replica for cardtree.
//!
//! A replica mirrors one card and its contents as held by the remote store.
//! It is a flat set of [`Record`]s keyed by id; tree shape is computed on
//! demand by [`TreeIndex`].
//!
//! # Copy-on-write
//!
//! [`CardTree`] is an immutable snapshot (cheap to clone, safe to hand to
//! readers). All edits go through [`MutableCardTree`], derived with
//! [`CardTree::mutable_copy`] and turned back into a new snapshot with
//! [`MutableCardTree::freeze`]. A snapshot is never mutated in place.
//!
//! ```text
//! CardTree ──mutable_copy()──▶ MutableCardTree ──apply_incremental()/load_full()──▶ freeze() ──▶ CardTree'
//! ```
//!
//! # Merge semantics
//!
//! - Records for other roots are ignored (shared feeds carry cross-talk)
//! - Tombstones remove; removing the root tears the whole replica down
//! - Otherwise newest `modified_at` wins; older deliveries are skipped
//! - Records whose parent has not arrived yet are kept until the next
//!   full sync, which settles them (see [`MutableCardTree::load_full`])

mod error;
mod index;
mod merge;
mod template;
mod tree;

pub use cardtree_types::{Record, RecordId, RecordKind};
pub use error::ReplicaError;
pub use index::TreeIndex;
pub use merge::MergeOutcome;
pub use template::DEFAULT_TEMPLATE_TITLE;
pub use tree::{CardTree, MutableCardTree, Orphan, SettleReport};

/// Maximum depth for tree traversal operations.
///
/// Content trees are shallow in practice; this guards against parent cycles
/// delivered by a misbehaving store.
pub const MAX_TREE_DEPTH: usize = 10_000;

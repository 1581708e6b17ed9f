//! Shared identity and record types for cardtree.
//!
//! This crate is the leaf of the workspace: typed IDs and the [`Record`] that
//! every other crate moves around. It has **no internal cardtree
//! dependencies**.
//!
//! # Record Model
//!
//! ```text
//! Card (RecordKind::Card, root_id == id, parent_id = None)
//!     └── Text / Checkbox / Image / Divider / Comment
//!           parent_id → the card or another content record
//!           root_id   → always the card
//! ```
//!
//! # Key Types
//!
//! |-------------------|----------------------------------------------|
//! | Type              | Purpose                                      |
//! |-------------------|----------------------------------------------|
//! | [`RecordId`]      | Globally unique record identity (UUIDv7)     |
//! | [`SessionId`]     | One activation of a card session             |
//! | [`Record`]        | A node of the card tree (root or content)    |
//! | [`RecordKind`]    | Discriminator: card vs. content kinds        |
//! | [`RecordBuilder`] | Fluent construction for tests and fixtures   |
//! |-------------------|----------------------------------------------|

pub mod ids;
pub mod record;

pub use ids::{PrefixError, RecordId, SessionId, resolve_record_prefix};
pub use record::{Record, RecordBuilder, RecordKind};

/// Current time as Unix milliseconds. Used by constructors throughout the crate.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

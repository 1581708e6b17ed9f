//! Records: the nodes of a card tree.
//!
//! A [`Record`] is immutable by convention. Replicas replace whole records
//! rather than editing fields, and every change carries a fresh
//! `modified_at` so receivers can discard stale deliveries.
//!
//! ## Field groups
//!
//! - **Identity**: id, parent_id, root_id
//! - **Shape**: kind, order
//! - **Revision**: modified_at, deleted
//! - **Card-only**: title is shared by all kinds, is_template only matters on cards
//! - **Payload**: fields, schema-free JSON, copied verbatim by every operation

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::RecordId;

/// What a record is.
///
/// `Card` is the only root kind; everything else is content hanging under a card.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum RecordKind {
    /// The root record of a tree.
    Card,
    /// Free text paragraph.
    #[default]
    Text,
    /// Checklist item.
    Checkbox,
    /// Image reference (URL or file id in `fields`).
    Image,
    /// Horizontal divider.
    Divider,
    /// Discussion comment.
    Comment,
}

impl RecordKind {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Card => "card",
            RecordKind::Text => "text",
            RecordKind::Checkbox => "checkbox",
            RecordKind::Image => "image",
            RecordKind::Divider => "divider",
            RecordKind::Comment => "comment",
        }
    }

    /// Whether records of this kind anchor a tree.
    pub fn is_root(&self) -> bool {
        matches!(self, RecordKind::Card)
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A node of a card tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Globally unique, never reassigned.
    pub id: RecordId,
    /// Owning record (None for roots).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RecordId>,
    /// The card this record lives under (equals `id` for roots).
    pub root_id: RecordId,
    /// Card vs. content discriminator.
    pub kind: RecordKind,
    /// Sibling sequence key (ascending).
    #[serde(default)]
    pub order: i64,
    /// Revision timestamp (Unix millis). Newer wins.
    pub modified_at: u64,
    /// Tombstone marker. Deleted records are removed, never rendered.
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    /// Card title, or the text of a content record.
    #[serde(default)]
    pub title: String,
    /// Only meaningful on cards.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_template: bool,
    /// Schema-free payload.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Helper for `#[serde(skip_serializing_if)]` on bool fields.
fn is_false(v: &bool) -> bool {
    !v
}

impl Record {
    /// Create a new card (root record).
    pub fn card(title: impl Into<String>) -> Self {
        let id = RecordId::new();
        RecordBuilder::new(id, id, RecordKind::Card).title(title).build()
    }

    /// Create a new content record under `root_id`, attached to `parent_id`.
    pub fn content(
        root_id: RecordId,
        parent_id: RecordId,
        kind: RecordKind,
        title: impl Into<String>,
    ) -> Self {
        RecordBuilder::new(RecordId::new(), root_id, kind)
            .parent_id(parent_id)
            .title(title)
            .build()
    }

    /// Whether this record is the root of its tree.
    pub fn is_root(&self) -> bool {
        self.id == self.root_id
    }

    /// A tombstone for this record, stamped at `modified_at`.
    ///
    /// Identity fields are kept so receivers can route the deletion.
    pub fn tombstone(&self, modified_at: u64) -> Self {
        Self {
            deleted: true,
            modified_at,
            ..self.clone()
        }
    }

    /// Whether `other` carries different stored content than `self`.
    ///
    /// Used to decide whether a replace actually changed anything.
    pub fn differs_from(&self, other: &Record) -> bool {
        self != other
    }
}

/// Fluent builder for [`Record`].
///
/// # Example
///
/// ```
/// use cardtree_types::{RecordBuilder, RecordId, RecordKind};
///
/// let card = RecordId::new();
/// let item = RecordBuilder::new(RecordId::new(), card, RecordKind::Checkbox)
///     .parent_id(card)
///     .title("buy milk")
///     .order(2)
///     .field("checked", serde_json::json!(true))
///     .build();
/// assert_eq!(item.root_id, card);
/// ```
pub struct RecordBuilder {
    record: Record,
}

impl RecordBuilder {
    /// Start building a record with the required identity fields.
    pub fn new(id: RecordId, root_id: RecordId, kind: RecordKind) -> Self {
        Self {
            record: Record {
                id,
                parent_id: None,
                root_id,
                kind,
                order: 0,
                modified_at: crate::now_millis(),
                deleted: false,
                title: String::new(),
                is_template: false,
                fields: serde_json::Map::new(),
            },
        }
    }

    pub fn parent_id(mut self, parent_id: RecordId) -> Self {
        self.record.parent_id = Some(parent_id);
        self
    }

    pub fn order(mut self, order: i64) -> Self {
        self.record.order = order;
        self
    }

    pub fn modified_at(mut self, modified_at: u64) -> Self {
        self.record.modified_at = modified_at;
        self
    }

    pub fn deleted(mut self, deleted: bool) -> Self {
        self.record.deleted = deleted;
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.record.title = title.into();
        self
    }

    pub fn is_template(mut self, is_template: bool) -> Self {
        self.record.is_template = is_template;
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.record.fields.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Record {
        self.record
    }
}

//! Snapshot and editing handle for a card tree.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::index::TreeIndex;
use crate::{MAX_TREE_DEPTH, Record, RecordId, ReplicaError};

#[derive(Debug)]
struct TreeInner {
    root: Record,
    contents: IndexMap<RecordId, Record>,
    version: u64,
}

/// Immutable point-in-time view of a card and its contents.
///
/// Cloning shares the underlying storage. Edits never touch a snapshot:
/// derive a [`MutableCardTree`] with [`CardTree::mutable_copy`] instead.
#[derive(Debug, Clone)]
pub struct CardTree {
    inner: Arc<TreeInner>,
}

impl CardTree {
    pub(crate) fn from_parts(
        root: Record,
        contents: IndexMap<RecordId, Record>,
        version: u64,
    ) -> Self {
        Self {
            inner: Arc::new(TreeInner { root, contents, version }),
        }
    }

    /// The card record.
    pub fn root(&self) -> &Record {
        &self.inner.root
    }

    pub fn root_id(&self) -> RecordId {
        self.inner.root.id
    }

    pub fn title(&self) -> &str {
        &self.inner.root.title
    }

    pub fn is_template(&self) -> bool {
        self.inner.root.is_template
    }

    /// Revision counter, bumped by every committed change.
    pub fn version(&self) -> u64 {
        self.inner.version
    }

    /// Look up the root or a content record.
    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        if *id == self.inner.root.id {
            Some(&self.inner.root)
        } else {
            self.inner.contents.get(id)
        }
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.get(id).is_some()
    }

    /// Content records in arrival order.
    pub fn contents(&self) -> impl Iterator<Item = &Record> {
        self.inner.contents.values()
    }

    pub fn content_count(&self) -> usize {
        self.inner.contents.len()
    }

    /// Root plus contents.
    pub fn len(&self) -> usize {
        self.inner.contents.len() + 1
    }

    /// A snapshot always holds its root.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Root first, then contents in arrival order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        std::iter::once(&self.inner.root).chain(self.inner.contents.values())
    }

    /// Content records whose parent chain does not currently reach the root.
    pub fn orphans(&self) -> Vec<Orphan> {
        unresolved_contents(self.inner.root.id, &self.inner.contents)
    }

    /// Whether both handles point at the very same snapshot.
    pub fn same_snapshot(&self, other: &CardTree) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Build the parent/child index for traversal.
    pub fn index(&self) -> TreeIndex<'_> {
        TreeIndex::from_tree(self)
    }

    /// Derive an editing handle. The snapshot itself is left untouched.
    pub fn mutable_copy(&self) -> MutableCardTree {
        MutableCardTree {
            root_id: self.inner.root.id,
            root: Some(self.inner.root.clone()),
            contents: self.inner.contents.clone(),
            version: self.inner.version,
            removed: false,
        }
    }
}

/// A content record left without a resolvable parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orphan {
    pub id: RecordId,
    pub parent_id: Option<RecordId>,
}

impl Orphan {
    pub fn into_error(self) -> ReplicaError {
        ReplicaError::UnresolvedParent {
            id: self.id,
            parent: self.parent_id,
        }
    }
}

/// Outcome of a settle point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettleReport {
    /// Records held after settling (root included).
    pub record_count: usize,
    /// Content records dropped because their parent never arrived.
    pub dropped: Vec<Orphan>,
}

impl SettleReport {
    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty()
    }
}

/// Editing handle for a card tree.
///
/// Created empty (only the root id known) by [`MutableCardTree::new`], or from
/// a snapshot by [`CardTree::mutable_copy`]. Commit with [`MutableCardTree::freeze`].
#[derive(Debug, Clone)]
pub struct MutableCardTree {
    pub(crate) root_id: RecordId,
    pub(crate) root: Option<Record>,
    pub(crate) contents: IndexMap<RecordId, Record>,
    pub(crate) version: u64,
    pub(crate) removed: bool,
}

impl MutableCardTree {
    /// An unsynced replica for `root_id`.
    pub fn new(root_id: RecordId) -> Self {
        Self {
            root_id,
            root: None,
            contents: IndexMap::new(),
            version: 0,
            removed: false,
        }
    }

    pub fn root_id(&self) -> RecordId {
        self.root_id
    }

    pub fn root(&self) -> Option<&Record> {
        self.root.as_ref()
    }

    /// Whether a root tombstone tore this replica down.
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        if *id == self.root_id {
            self.root.as_ref()
        } else {
            self.contents.get(id)
        }
    }

    pub fn content_count(&self) -> usize {
        self.contents.len()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn bump(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    /// Replace all held state with an authoritative full record set.
    ///
    /// Tombstones in the set are skipped. Duplicate ids, records for another
    /// root, or a missing root are rejected and leave the handle unchanged.
    /// On success the result is settled: contents whose parent is absent from
    /// the authoritative set are dropped and listed in the report.
    pub fn load_full(&mut self, records: Vec<Record>) -> Result<SettleReport, ReplicaError> {
        let mut root = None;
        let mut contents = IndexMap::with_capacity(records.len());

        for record in records {
            if record.deleted {
                debug!("full sync: skipping tombstone {:?}", record.id);
                continue;
            }
            if record.root_id != self.root_id {
                return Err(ReplicaError::ForeignRecord {
                    id: record.id,
                    expected: self.root_id,
                    got: record.root_id,
                });
            }
            if record.id == self.root_id {
                if root.is_some() {
                    return Err(ReplicaError::DuplicateRecord(record.id));
                }
                root = Some(record);
            } else if contents.contains_key(&record.id) {
                return Err(ReplicaError::DuplicateRecord(record.id));
            } else {
                contents.insert(record.id, record);
            }
        }

        let Some(root) = root else {
            return Err(ReplicaError::MissingRoot(self.root_id));
        };

        self.root = Some(root);
        self.contents = contents;
        self.removed = false;
        self.bump();

        let report = self.settle();
        info!(
            root_id = %self.root_id,
            records = report.record_count,
            dropped = report.dropped.len(),
            "full sync loaded"
        );
        Ok(report)
    }

    /// Drop content records whose parent chain does not reach the root.
    pub fn settle(&mut self) -> SettleReport {
        let dropped = unresolved_contents(self.root_id, &self.contents);
        for orphan in &dropped {
            warn!(
                "dropping record {:?}: parent {:?} never resolved",
                orphan.id, orphan.parent_id
            );
            self.contents.shift_remove(&orphan.id);
        }
        if !dropped.is_empty() {
            self.bump();
        }
        SettleReport {
            record_count: self.contents.len() + usize::from(self.root.is_some()),
            dropped,
        }
    }

    /// Commit into a new snapshot.
    pub fn freeze(self) -> Result<CardTree, ReplicaError> {
        match self.root {
            Some(root) => Ok(CardTree::from_parts(root, self.contents, self.version)),
            None => Err(ReplicaError::MissingRoot(self.root_id)),
        }
    }
}

/// Content records whose parent chain fails to reach `root_id`.
///
/// Walks each chain once, memoizing results. Cycles and chains deeper than
/// [`MAX_TREE_DEPTH`] count as unresolved.
fn unresolved_contents(root_id: RecordId, contents: &IndexMap<RecordId, Record>) -> Vec<Orphan> {
    let mut resolved: HashMap<RecordId, bool> = HashMap::with_capacity(contents.len());

    for start in contents.keys() {
        if resolved.contains_key(start) {
            continue;
        }
        let mut chain = vec![*start];
        let mut cursor = contents.get(start).and_then(|r| r.parent_id);
        let verdict = loop {
            match cursor {
                None => break false,
                Some(p) if p == root_id => break true,
                Some(p) => {
                    if let Some(&known) = resolved.get(&p) {
                        break known;
                    }
                    if chain.contains(&p) || chain.len() > MAX_TREE_DEPTH {
                        break false;
                    }
                    match contents.get(&p) {
                        Some(parent) => {
                            chain.push(p);
                            cursor = parent.parent_id;
                        }
                        None => break false,
                    }
                }
            }
        };
        for id in chain {
            resolved.insert(id, verdict);
        }
    }

    contents
        .values()
        .filter(|r| !resolved.get(&r.id).copied().unwrap_or(false))
        .map(|r| Orphan { id: r.id, parent_id: r.parent_id })
        .collect()
}

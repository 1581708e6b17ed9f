//! Incremental merge of change batches into a [`MutableCardTree`].

use tracing::{debug, info, trace};

use crate::{MutableCardTree, Record};

/// What a batch did to the replica.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Any insert, replace, or removal actually altered stored content.
    pub changed: bool,
    /// The batch carried the root's tombstone; the replica is torn down.
    pub root_removed: bool,
    pub inserted: usize,
    pub replaced: usize,
    pub removed: usize,
    /// Entries older than held state (stale or duplicate delivery).
    pub stale: usize,
    /// Entries for another root (shared-feed cross-talk).
    pub foreign: usize,
}

impl MutableCardTree {
    /// Merge a change batch, in order.
    ///
    /// Per record:
    /// 1. Different `root_id` → ignored.
    /// 2. Tombstone → remove if held. The root's tombstone tears the replica
    ///    down; later entries in the batch are then ignored.
    /// 3. Otherwise insert if absent, replace if not older than held state,
    ///    skip if older.
    ///
    /// Records whose parent has not arrived are kept as-is.
    pub fn apply_incremental(&mut self, batch: &[Record]) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for record in batch {
            if record.root_id != self.root_id {
                outcome.foreign += 1;
                continue;
            }
            if self.removed {
                trace!("replica {:?} torn down, ignoring {:?}", self.root_id, record.id);
                continue;
            }

            if record.deleted {
                self.apply_tombstone(record, &mut outcome);
            } else {
                self.apply_upsert(record, &mut outcome);
            }
        }

        if outcome.changed {
            self.bump();
        }
        debug!(
            root_id = %self.root_id,
            changed = outcome.changed,
            inserted = outcome.inserted,
            replaced = outcome.replaced,
            removed = outcome.removed,
            stale = outcome.stale,
            foreign = outcome.foreign,
            "incremental batch merged"
        );
        outcome
    }

    fn apply_tombstone(&mut self, record: &Record, outcome: &mut MergeOutcome) {
        if record.id == self.root_id {
            info!("root {:?} deleted, tearing down replica", self.root_id);
            let had_state = self.root.take().is_some() || !self.contents.is_empty();
            self.contents.clear();
            self.removed = true;
            outcome.root_removed = true;
            if had_state {
                outcome.changed = true;
                outcome.removed += 1;
            }
            return;
        }

        if self.contents.shift_remove(&record.id).is_some() {
            outcome.changed = true;
            outcome.removed += 1;
        }
    }

    fn apply_upsert(&mut self, record: &Record, outcome: &mut MergeOutcome) {
        let slot = if record.id == self.root_id {
            self.root.as_mut()
        } else {
            self.contents.get_mut(&record.id)
        };

        match slot {
            Some(existing) => {
                if record.modified_at < existing.modified_at {
                    trace!(
                        "stale update for {:?}: {} < {}",
                        record.id, record.modified_at, existing.modified_at
                    );
                    outcome.stale += 1;
                } else if existing.differs_from(record) {
                    *existing = record.clone();
                    outcome.changed = true;
                    outcome.replaced += 1;
                }
            }
            None if record.id == self.root_id => {
                self.root = Some(record.clone());
                outcome.changed = true;
                outcome.inserted += 1;
            }
            None => {
                self.contents.insert(record.id, record.clone());
                outcome.changed = true;
                outcome.inserted += 1;
            }
        }
    }
}

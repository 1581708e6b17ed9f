//! Computed parent/child index over a card tree snapshot.
//!
//! The index is ephemeral: built on demand from the flat record set in a
//! [`CardTree`] and borrowed from it. It never modifies the snapshot.

use std::collections::{HashMap, HashSet};

use crate::{CardTree, MAX_TREE_DEPTH, Record, RecordId};

/// Parent/child index over a [`CardTree`].
#[derive(Debug, Clone)]
pub struct TreeIndex<'a> {
    root: &'a Record,
    /// Children by parent id, sorted by `(order, id)`.
    children: HashMap<RecordId, Vec<&'a Record>>,
    records: HashMap<RecordId, &'a Record>,
}

impl<'a> TreeIndex<'a> {
    pub fn from_tree(tree: &'a CardTree) -> Self {
        let mut children: HashMap<RecordId, Vec<&'a Record>> = HashMap::new();
        let mut records = HashMap::with_capacity(tree.len());

        records.insert(tree.root_id(), tree.root());
        for record in tree.contents() {
            if let Some(parent_id) = record.parent_id {
                children.entry(parent_id).or_default().push(record);
            }
            records.insert(record.id, record);
        }
        for siblings in children.values_mut() {
            siblings.sort_by_key(|r| (r.order, r.id));
        }

        Self { root: tree.root(), children, records }
    }

    pub fn root(&self) -> &'a Record {
        self.root
    }

    pub fn get(&self, id: &RecordId) -> Option<&'a Record> {
        self.records.get(id).copied()
    }

    /// Children of a record, in sibling order.
    pub fn children(&self, id: &RecordId) -> &[&'a Record] {
        self.children.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Depth-first walk from the root. Yields `(depth, record)` with the
    /// root at depth 0. Records not reachable from the root are skipped.
    pub fn iter_dfs(&self) -> impl Iterator<Item = (usize, &'a Record)> + '_ {
        DfsIter {
            index: self,
            stack: vec![(0, self.root)],
            visited: HashSet::new(),
        }
    }

    /// The record and everything below it, depth-first.
    ///
    /// Circuit-breaks at `MAX_TREE_DEPTH` visited records.
    pub fn subtree(&self, id: &RecordId) -> Vec<&'a Record> {
        let mut result = Vec::new();
        let Some(start) = self.get(id) else {
            return result;
        };
        let mut stack = vec![start];
        let mut visited = HashSet::new();

        while let Some(record) = stack.pop() {
            if !visited.insert(record.id) {
                continue;
            }
            if visited.len() > MAX_TREE_DEPTH {
                tracing::warn!("subtree traversal hit MAX_TREE_DEPTH ({MAX_TREE_DEPTH}), truncating");
                break;
            }
            result.push(record);
            for child in self.children(&record.id).iter().rev() {
                stack.push(child);
            }
        }

        result
    }

    /// Hops from the root (0 for the root itself).
    ///
    /// Returns `None` when the chain does not reach the root.
    pub fn depth(&self, id: &RecordId) -> Option<usize> {
        let mut depth = 0;
        let mut current = self.get(id)?;

        while current.id != self.root.id {
            if depth >= MAX_TREE_DEPTH {
                tracing::warn!("depth() hit MAX_TREE_DEPTH ({MAX_TREE_DEPTH})");
                return None;
            }
            current = self.get(&current.parent_id?)?;
            depth += 1;
        }

        Some(depth)
    }

    /// Ancestors from the immediate parent up to (and including) the root.
    pub fn ancestors(&self, id: &RecordId) -> Vec<&'a Record> {
        let mut result = Vec::new();
        let mut current = self.get(id);

        while let Some(record) = current {
            if record.id == self.root.id {
                break;
            }
            if result.len() >= MAX_TREE_DEPTH {
                tracing::warn!("ancestors() hit MAX_TREE_DEPTH ({MAX_TREE_DEPTH}), truncating");
                break;
            }
            current = record.parent_id.and_then(|p| self.get(&p));
            if let Some(parent) = current {
                result.push(parent);
            }
        }

        result
    }

    /// Ids of every record reachable from the root.
    pub fn reachable(&self) -> HashSet<RecordId> {
        self.iter_dfs().map(|(_, r)| r.id).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

struct DfsIter<'i, 'a> {
    index: &'i TreeIndex<'a>,
    stack: Vec<(usize, &'a Record)>,
    visited: HashSet<RecordId>,
}

impl<'a> Iterator for DfsIter<'_, 'a> {
    type Item = (usize, &'a Record);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((depth, record)) = self.stack.pop() {
            if !self.visited.insert(record.id) {
                continue;
            }
            if self.visited.len() > MAX_TREE_DEPTH {
                tracing::warn!("DFS iterator hit MAX_TREE_DEPTH ({MAX_TREE_DEPTH}), stopping");
                return None;
            }
            for child in self.index.children(&record.id).iter().rev() {
                self.stack.push((depth + 1, child));
            }
            return Some((depth, record));
        }
        None
    }
}

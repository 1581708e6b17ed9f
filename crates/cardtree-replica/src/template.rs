//! Template duplication: structural clone of a card tree under fresh ids.

use std::collections::HashMap;

use indexmap::IndexMap;
use tracing::debug;

use crate::{CardTree, RecordId};

/// Title given to a template created from a card.
pub const DEFAULT_TEMPLATE_TITLE: &str = "New Template";

impl CardTree {
    /// Clone this card into a template titled [`DEFAULT_TEMPLATE_TITLE`].
    pub fn template_copy(&self) -> CardTree {
        self.template_copy_titled(DEFAULT_TEMPLATE_TITLE)
    }

    pub fn template_copy_titled(&self, title: &str) -> CardTree {
        self.template_copy_mapped(title).0
    }

    /// Clone the tree under fresh ids, returning the old → new id map.
    ///
    /// Every record reachable from the root gets a new id; parent and root
    /// references are rewritten through the map so the clone is isomorphic
    /// to the source. The new root is flagged as a template and retitled.
    /// Kind, order, and payload are copied verbatim. The source is untouched.
    ///
    /// Records not reachable from the root are left out.
    pub fn template_copy_mapped(&self, title: &str) -> (CardTree, HashMap<RecordId, RecordId>) {
        let reachable = self.index().reachable();

        let mut id_map: HashMap<RecordId, RecordId> = HashMap::with_capacity(reachable.len());
        for record in self.records().filter(|r| reachable.contains(&r.id)) {
            id_map.insert(record.id, RecordId::new());
        }
        let new_root_id = id_map[&self.root_id()];

        let mut root = self.root().clone();
        root.id = new_root_id;
        root.root_id = new_root_id;
        root.parent_id = None;
        root.is_template = true;
        root.title = title.to_string();

        let mut contents = IndexMap::with_capacity(id_map.len().saturating_sub(1));
        for record in self.contents().filter(|r| id_map.contains_key(&r.id)) {
            let mut copy = record.clone();
            copy.id = id_map[&record.id];
            copy.root_id = new_root_id;
            copy.parent_id = record.parent_id.and_then(|p| id_map.get(&p).copied());
            contents.insert(copy.id, copy);
        }

        debug!(
            source = %self.root_id(),
            template = %new_root_id,
            records = id_map.len(),
            "template copy built"
        );
        (CardTree::from_parts(root, contents, 0), id_map)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{MutableCardTree, Record, RecordKind};
    use cardtree_types::RecordBuilder;

    fn create_tree() -> CardTree {
        let card = Record::card("Plan");
        let a = RecordBuilder::new(RecordId::new(), card.id, RecordKind::Text)
            .parent_id(card.id)
            .order(1)
            .title("a")
            .field("color", serde_json::json!("red"))
            .build();
        let b = RecordBuilder::new(RecordId::new(), card.id, RecordKind::Checkbox)
            .parent_id(a.id)
            .order(2)
            .title("b")
            .build();
        let mut tree = MutableCardTree::new(card.id);
        tree.load_full(vec![card, a, b]).unwrap();
        tree.freeze().unwrap()
    }

    #[test]
    fn test_template_is_isomorphic_with_fresh_ids() {
        let source = create_tree();
        let (copy, id_map) = source.template_copy_mapped(DEFAULT_TEMPLATE_TITLE);

        assert_eq!(copy.len(), source.len());
        assert!(copy.is_template());
        assert_eq!(copy.title(), "New Template");
        assert_eq!(copy.version(), 0);

        let old_ids: HashSet<_> = source.records().map(|r| r.id).collect();
        let new_ids: HashSet<_> = copy.records().map(|r| r.id).collect();
        assert!(old_ids.is_disjoint(&new_ids));

        for old in source.contents() {
            let new = copy.get(&id_map[&old.id]).expect("mapped record present");
            assert_eq!(new.root_id, copy.root_id());
            assert_eq!(new.parent_id, old.parent_id.map(|p| id_map[&p]));
            assert_eq!(new.kind, old.kind);
            assert_eq!(new.order, old.order);
            assert_eq!(new.title, old.title);
            assert_eq!(new.fields, old.fields);
        }
        assert!(copy.orphans().is_empty());
    }

    #[test]
    fn test_source_is_untouched() {
        let source = create_tree();
        let before: Vec<_> = source.records().cloned().collect();
        let _ = source.template_copy();
        let after: Vec<_> = source.records().cloned().collect();
        assert_eq!(before, after);
        assert!(!source.is_template());
        assert_eq!(source.title(), "Plan");
    }

    #[test]
    fn test_unreachable_records_are_not_copied() {
        let source = create_tree();
        let mut copy = source.mutable_copy();
        let stray = Record::content(source.root_id(), RecordId::new(), RecordKind::Text, "stray");
        copy.apply_incremental(&[stray]);
        let source = copy.freeze().unwrap();

        let template = source.template_copy_titled("T");
        assert_eq!(template.len(), source.len() - 1);
        assert_eq!(template.title(), "T");
    }
}

use std::cmp::Ordering;
use std::sync::Arc;

use crate::model::collections::{document_key_set, DocumentKeySet};
use crate::model::DocumentKey;
use crate::util::sorted_set::SortedSet;

/// One document-to-id association. The id is a target id or batch id
/// depending on which reference set this lives in.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DocReference {
    pub key: DocumentKey,
    pub id: i32,
}

fn by_key(a: &DocReference, b: &DocReference) -> Ordering {
    a.key.cmp(&b.key).then_with(|| a.id.cmp(&b.id))
}

fn by_id(a: &DocReference, b: &DocReference) -> Ordering {
    a.id.cmp(&b.id).then_with(|| a.key.cmp(&b.key))
}

/// A bidirectional many-to-many index between document keys and integer
/// ids, kept as two sorted sets so both directions support efficient
/// range scans.
pub struct ReferenceSet {
    refs_by_key: SortedSet<DocReference>,
    refs_by_id: SortedSet<DocReference>,
}

impl Default for ReferenceSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self {
            refs_by_key: SortedSet::with_comparator(Arc::new(by_key)),
            refs_by_id: SortedSet::with_comparator(Arc::new(by_id)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.refs_by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        let reference = DocReference { key, id };
        self.refs_by_key = self.refs_by_key.insert(reference.clone());
        self.refs_by_id = self.refs_by_id.insert(reference);
    }

    pub fn add_references(&mut self, keys: &DocumentKeySet, id: i32) {
        for key in keys.iter() {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        let reference = DocReference {
            key: key.clone(),
            id,
        };
        self.refs_by_key = self.refs_by_key.remove(&reference);
        self.refs_by_id = self.refs_by_id.remove(&reference);
    }

    pub fn remove_references(&mut self, keys: &DocumentKeySet, id: i32) {
        for key in keys.iter() {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference with `id` and returns the affected keys.
    pub fn remove_references_for_id(&mut self, id: i32) -> DocumentKeySet {
        let keys = self.references_for_id(id);
        for key in keys.iter() {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn references_for_id(&self, id: i32) -> DocumentKeySet {
        let mut keys = document_key_set();
        let start = DocReference {
            // Keys order after ids in `by_id`, so the empty key is the
            // lower bound for this id.
            key: DocumentKey::empty(),
            id,
        };
        for reference in self.refs_by_id.iter_from(&start) {
            if reference.id != id {
                break;
            }
            keys = keys.insert(reference.key.clone());
        }
        keys
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        let start = DocReference {
            key: key.clone(),
            id: i32::MIN,
        };
        self.refs_by_key
            .iter_from(&start)
            .next()
            .map(|reference| reference.key == *key)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_path_string(path).unwrap()
    }

    #[test]
    fn add_and_lookup_by_id() {
        let mut refs = ReferenceSet::new();
        refs.add_reference(key("docs/a"), 1);
        refs.add_reference(key("docs/b"), 1);
        refs.add_reference(key("docs/c"), 2);
        let for_one = refs.references_for_id(1);
        assert_eq!(for_one.len(), 2);
        assert!(for_one.contains(&key("docs/a")));
        assert!(!for_one.contains(&key("docs/c")));
    }

    #[test]
    fn contains_key_across_ids() {
        let mut refs = ReferenceSet::new();
        refs.add_reference(key("docs/a"), 5);
        assert!(refs.contains_key(&key("docs/a")));
        assert!(!refs.contains_key(&key("docs/b")));
        refs.remove_reference(&key("docs/a"), 5);
        assert!(!refs.contains_key(&key("docs/a")));
    }

    #[test]
    fn remove_references_for_id_returns_keys() {
        let mut refs = ReferenceSet::new();
        refs.add_reference(key("docs/a"), 1);
        refs.add_reference(key("docs/a"), 2);
        refs.add_reference(key("docs/b"), 1);
        let removed = refs.remove_references_for_id(1);
        assert_eq!(removed.len(), 2);
        // docs/a is still referenced by id 2.
        assert!(refs.contains_key(&key("docs/a")));
        assert!(!refs.contains_key(&key("docs/b")));
    }
}

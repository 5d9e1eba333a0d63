use std::cmp::Ordering;
use std::sync::Arc;

use crate::core::query::Query;
use crate::model::collections::DocumentKeySet;
use crate::model::document::Document;
use crate::model::DocumentKey;
use crate::util::assert::fail;
use crate::util::sorted_map::{Comparator, SortedMap};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only pending-write state changed; the data is identical.
    Metadata,
}

/// Order used when presenting a snapshot's change list: removals first,
/// then additions, then modifications.
pub fn compare_change_types(c1: ChangeType, c2: ChangeType) -> Ordering {
    fn rank(c: ChangeType) -> u8 {
        match c {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
    rank(c1).cmp(&rank(c2))
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncState {
    /// Results may lag the server (offline or not yet current).
    Local,
    /// The server confirmed the result set as complete and current.
    Synced,
}

#[derive(Clone, Debug)]
pub struct DocumentViewChange {
    pub doc: Document,
    pub change_type: ChangeType,
}

/// Accumulates per-document changes, collapsing multiple changes to the
/// same document into the single change an observer should see.
pub struct DocumentChangeSet {
    changes: SortedMap<DocumentKey, DocumentViewChange>,
}

impl Default for DocumentChangeSet {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self {
            changes: SortedMap::new(),
        }
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.doc.key.clone();
        let old = match self.changes.get(&key) {
            None => {
                self.changes = self.changes.insert(key, change);
                return;
            }
            Some(old) => old.clone(),
        };
        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            // Metadata over anything but an add keeps the old type.
            (_, Metadata) if old.change_type != Added => DocumentViewChange {
                doc: change.doc,
                change_type: old.change_type,
            },
            (Metadata, Removed) => DocumentViewChange {
                doc: change.doc,
                change_type: Removed,
            },
            (Added, Modified) | (Added, Metadata) => DocumentViewChange {
                doc: change.doc,
                change_type: Added,
            },
            (Added, Removed) => {
                self.changes = self.changes.remove(&key);
                return;
            }
            (Modified, Modified) | (Metadata, Modified) => DocumentViewChange {
                doc: change.doc,
                change_type: Modified,
            },
            (Modified, Removed) => DocumentViewChange {
                doc: change.doc,
                change_type: Removed,
            },
            (Removed, Added) => DocumentViewChange {
                doc: change.doc,
                change_type: Modified,
            },
            (old_type, new_type) => fail(format!(
                "unsupported change combination: {old_type:?} after {new_type:?}"
            )),
        };
        self.changes = self.changes.insert(key, merged);
    }

    pub fn get_changes(&self) -> Vec<DocumentViewChange> {
        self.changes.iter().map(|(_, c)| c.clone()).collect()
    }
}

/// An ordered set of documents indexed both by key and by a query's
/// comparator.
pub struct DocumentSet {
    /// Key-ordered index used for point lookups.
    keyed: SortedMap<DocumentKey, Document>,
    /// Query-ordered index used for iteration and limits.
    sorted: SortedMap<Document, ()>,
}

impl Clone for DocumentSet {
    fn clone(&self) -> Self {
        Self {
            keyed: self.keyed.clone(),
            sorted: self.sorted.clone(),
        }
    }
}

impl DocumentSet {
    /// Creates an empty set ordered by `comparator`, with ties broken by
    /// document key so the order is total.
    pub fn new(comparator: Comparator<Document>) -> Self {
        let full: Comparator<Document> = Arc::new(move |d1: &Document, d2: &Document| {
            comparator(d1, d2).then_with(|| d1.key.cmp(&d2.key))
        });
        Self {
            keyed: SortedMap::new(),
            sorted: SortedMap::with_comparator(full),
        }
    }

    pub fn for_query(query: &Query) -> Self {
        Self::new(query.comparator())
    }

    pub fn len(&self) -> usize {
        self.keyed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyed.is_empty()
    }

    pub fn has(&self, key: &DocumentKey) -> bool {
        self.keyed.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.keyed.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.min_key()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.max_key()
    }

    /// Index of the document with `key` in query order, if present.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        self.keyed.get(key).map(|doc| self.sorted.index_of(doc))
    }

    /// Adds `doc`, replacing any previous document with the same key.
    pub fn add(&self, doc: Document) -> Self {
        let removed = self.delete(&doc.key);
        Self {
            keyed: removed.keyed.insert(doc.key.clone(), doc.clone()),
            sorted: removed.sorted.insert(doc, ()),
        }
    }

    pub fn delete(&self, key: &DocumentKey) -> Self {
        match self.keyed.get(key) {
            None => self.clone(),
            Some(doc) => Self {
                keyed: self.keyed.remove(key),
                sorted: self.sorted.remove(doc),
            },
        }
    }

    /// Iterates in query order.
    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sorted.iter().map(|(doc, _)| doc)
    }

    pub fn keys(&self) -> DocumentKeySet {
        let mut keys = DocumentKeySet::new();
        for (key, _) in self.keyed.iter() {
            keys = keys.insert(key.clone());
        }
        keys
    }

    pub fn equals(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl std::fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter().map(|d| &d.key)).finish()
    }
}

/// The result of evaluating a query at a point in time, plus what changed
/// since the previous snapshot.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    pub mutated_keys: DocumentKeySet,
    pub from_cache: bool,
    pub sync_state_changed: bool,
}

impl ViewSnapshot {
    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::document::DocumentState;
    use crate::model::object_value::ObjectValue;
    use crate::model::resource_path::ResourcePath;
    use crate::model::SnapshotVersion;
    use serde_json::json;

    fn doc(path: &str, rank: i64) -> Document {
        Document {
            key: DocumentKey::from_path_string(path).unwrap(),
            version: SnapshotVersion::new(1, 0),
            data: ObjectValue::from_value(json!({ "rank": rank })),
            state: DocumentState::Synced,
        }
    }

    fn rank_set() -> DocumentSet {
        let query = Query::at_path(ResourcePath::from_string("docs").unwrap()).with_order_by(
            crate::core::query::OrderBy::new(
                crate::model::object_value::FieldPath::from_dot_separated("rank"),
                crate::core::query::Direction::Ascending,
            ),
        );
        DocumentSet::for_query(&query)
    }

    #[test]
    fn document_set_iterates_in_query_order() {
        let set = rank_set()
            .add(doc("docs/c", 1))
            .add(doc("docs/a", 3))
            .add(doc("docs/b", 2));
        let order: Vec<&str> = set.iter().map(|d| d.key.document_id()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
        assert_eq!(set.index_of(&doc("docs/b", 2).key), Some(1));
    }

    #[test]
    fn document_set_add_replaces_by_key() {
        let set = rank_set().add(doc("docs/a", 1)).add(doc("docs/a", 9));
        assert_eq!(set.len(), 1);
        assert_eq!(set.first().map(|d| d.key.document_id()), Some("a"));
        let order: Vec<i64> = set
            .iter()
            .map(|d| {
                d.data
                    .field(&crate::model::object_value::FieldPath::from_dot_separated("rank"))
                    .and_then(|v| v.as_i64())
                    .unwrap()
            })
            .collect();
        assert_eq!(order, vec![9]);
    }

    #[test]
    fn change_set_collapses_add_then_modify() {
        let mut changes = DocumentChangeSet::new();
        changes.track(DocumentViewChange {
            doc: doc("docs/a", 1),
            change_type: ChangeType::Added,
        });
        changes.track(DocumentViewChange {
            doc: doc("docs/a", 2),
            change_type: ChangeType::Modified,
        });
        let result = changes.get_changes();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].change_type, ChangeType::Added);
    }

    #[test]
    fn change_set_cancels_add_then_remove() {
        let mut changes = DocumentChangeSet::new();
        changes.track(DocumentViewChange {
            doc: doc("docs/a", 1),
            change_type: ChangeType::Added,
        });
        changes.track(DocumentViewChange {
            doc: doc("docs/a", 1),
            change_type: ChangeType::Removed,
        });
        assert!(changes.get_changes().is_empty());
    }

    #[test]
    fn removed_then_added_becomes_modified() {
        let mut changes = DocumentChangeSet::new();
        changes.track(DocumentViewChange {
            doc: doc("docs/a", 1),
            change_type: ChangeType::Removed,
        });
        changes.track(DocumentViewChange {
            doc: doc("docs/a", 2),
            change_type: ChangeType::Added,
        });
        let result = changes.get_changes();
        assert_eq!(result[0].change_type, ChangeType::Modified);
    }

    #[test]
    fn change_type_ordering() {
        assert_eq!(
            compare_change_types(ChangeType::Removed, ChangeType::Added),
            Ordering::Less
        );
        assert_eq!(
            compare_change_types(ChangeType::Modified, ChangeType::Metadata),
            Ordering::Equal
        );
    }
}

use crate::core::query::Query;
use crate::model::collections::{maybe_document_map, DocumentKeySet, MaybeDocumentMap};
use crate::model::document::MaybeDocument;
use crate::model::{DocumentKey, SnapshotVersion};
use crate::util::sorted_map::SortedMap;

/// Cache of the latest server-confirmed document states, stamped with the
/// snapshot version they were read at so query replay can ask for
/// "documents changed since".
pub struct MemoryRemoteDocumentCache {
    docs: SortedMap<DocumentKey, (MaybeDocument, SnapshotVersion)>,
}

impl Default for MemoryRemoteDocumentCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteDocumentCache {
    pub fn new() -> Self {
        Self {
            docs: SortedMap::new(),
        }
    }

    pub fn add_entry(&mut self, doc: MaybeDocument, read_time: SnapshotVersion) {
        self.docs = self.docs.insert(doc.key().clone(), (doc, read_time));
    }

    pub fn remove_entry(&mut self, key: &DocumentKey) {
        self.docs = self.docs.remove(key);
    }

    pub fn get_entry(&self, key: &DocumentKey) -> Option<&MaybeDocument> {
        self.docs.get(key).map(|(doc, _)| doc)
    }

    /// Looks up all `keys`; missing entries are absent from the result.
    pub fn get_entries(&self, keys: &DocumentKeySet) -> MaybeDocumentMap {
        let mut result = maybe_document_map();
        for key in keys.iter() {
            if let Some((doc, _)) = self.docs.get(key) {
                result = result.insert(key.clone(), doc.clone());
            }
        }
        result
    }

    /// All existing documents under the query's path that were read after
    /// `since_read_time`, before mutations are applied. Non-existent and
    /// unknown entries never match.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> MaybeDocumentMap {
        let mut result = maybe_document_map();
        for (key, (doc, read_time)) in self.docs.iter() {
            if !query.path.is_prefix_of(key.path()) {
                continue;
            }
            if *read_time <= since_read_time {
                continue;
            }
            if let MaybeDocument::Document(document) = doc {
                if query.matches(document) {
                    result = result.insert(key.clone(), doc.clone());
                }
            }
        }
        result
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.docs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::document::{Document, DocumentState};
    use crate::model::object_value::ObjectValue;
    use crate::model::resource_path::ResourcePath;
    use serde_json::json;

    fn doc(path: &str, version: i64) -> MaybeDocument {
        MaybeDocument::Document(Document {
            key: DocumentKey::from_path_string(path).unwrap(),
            version: SnapshotVersion::new(version, 0),
            data: ObjectValue::from_value(json!({})),
            state: DocumentState::Synced,
        })
    }

    #[test]
    fn stores_and_retrieves() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(doc("docs/a", 1), SnapshotVersion::new(1, 0));
        assert!(cache
            .get_entry(&DocumentKey::from_path_string("docs/a").unwrap())
            .is_some());
        cache.remove_entry(&DocumentKey::from_path_string("docs/a").unwrap());
        assert!(cache
            .get_entry(&DocumentKey::from_path_string("docs/a").unwrap())
            .is_none());
    }

    #[test]
    fn query_respects_read_time() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(doc("docs/a", 1), SnapshotVersion::new(1, 0));
        cache.add_entry(doc("docs/b", 2), SnapshotVersion::new(5, 0));
        let query = Query::at_path(ResourcePath::from_string("docs").unwrap());
        let all = cache.get_documents_matching_query(&query, SnapshotVersion::min());
        assert_eq!(all.len(), 2);
        let recent = cache.get_documents_matching_query(&query, SnapshotVersion::new(2, 0));
        assert_eq!(recent.len(), 1);
        assert!(recent
            .get(&DocumentKey::from_path_string("docs/b").unwrap())
            .is_some());
    }
}

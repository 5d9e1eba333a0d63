//! Merges the remote document cache with the pending mutation queue to
//! produce the documents a local reader should see.

use crate::core::query::Query;
use crate::local::memory_mutation_queue::MemoryMutationQueue;
use crate::local::memory_remote_document_cache::MemoryRemoteDocumentCache;
use crate::model::collections::{maybe_document_map, DocumentKeySet, MaybeDocumentMap};
use crate::model::document::MaybeDocument;
use crate::model::mutation_batch::MutationBatch;
use crate::model::{DocumentKey, SnapshotVersion};

/// The local view of one document: cached server state with all pending
/// batches replayed on top.
pub fn get_document(
    remote_documents: &MemoryRemoteDocumentCache,
    mutation_queue: &MemoryMutationQueue,
    key: &DocumentKey,
) -> Option<MaybeDocument> {
    let batches = mutation_queue.all_mutation_batches_affecting_document_key(key);
    get_document_internal(remote_documents, key, &batches)
}

fn get_document_internal(
    remote_documents: &MemoryRemoteDocumentCache,
    key: &DocumentKey,
    batches: &[MutationBatch],
) -> Option<MaybeDocument> {
    let mut doc = remote_documents.get_entry(key).cloned();
    for batch in batches {
        doc = batch.apply_to_local_view(key, doc);
    }
    doc
}

/// The local view of every key in `keys`. Keys with no cached state and
/// no mutations are absent from the result.
pub fn get_documents(
    remote_documents: &MemoryRemoteDocumentCache,
    mutation_queue: &MemoryMutationQueue,
    keys: &DocumentKeySet,
) -> MaybeDocumentMap {
    let batches = mutation_queue.all_mutation_batches_affecting_document_keys(keys);
    let mut results = maybe_document_map();
    for key in keys.iter() {
        if let Some(doc) = get_document_internal(remote_documents, key, &batches) {
            results = results.insert(key.clone(), doc);
        }
    }
    results
}

/// Runs `query` against the local view: cached matches read after
/// `since_read_time`, plus any documents a pending mutation could have
/// moved into the result set.
pub fn get_documents_matching_query(
    remote_documents: &MemoryRemoteDocumentCache,
    mutation_queue: &MemoryMutationQueue,
    query: &Query,
    since_read_time: SnapshotVersion,
) -> MaybeDocumentMap {
    let mut results = remote_documents.get_documents_matching_query(query, since_read_time);
    let batches = mutation_queue.all_mutation_batches_affecting_query(query);
    for batch in &batches {
        for mutation in &batch.mutations {
            let key = mutation.key();
            // Only documents in the query's scope can be affected.
            if query.collection_group.is_none()
                && !query.path.is_immediate_parent_of(key.path())
            {
                continue;
            }
            let base_doc = results.get(key).cloned();
            let mutated = mutation.apply_to_local_view(base_doc, batch.local_write_time);
            match mutated {
                Some(MaybeDocument::Document(doc)) => {
                    results = results.insert(key.clone(), MaybeDocument::Document(doc));
                }
                _ => {
                    results = results.remove(key);
                }
            }
        }
    }
    // Re-filter: a mutation may have made a previously matching document
    // no longer match.
    let mut filtered = maybe_document_map();
    for (key, doc) in results.iter() {
        if let MaybeDocument::Document(document) = doc {
            if query.matches(document) {
                filtered = filtered.insert(key.clone(), doc.clone());
            }
        }
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::document::{Document, DocumentState};
    use crate::model::mutation::{Mutation, Precondition};
    use crate::model::object_value::ObjectValue;
    use crate::model::resource_path::ResourcePath;
    use serde_json::json;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_path_string(path).unwrap()
    }

    fn server_doc(path: &str, version: i64, data: serde_json::Value) -> MaybeDocument {
        MaybeDocument::Document(Document {
            key: key(path),
            version: SnapshotVersion::new(version, 0),
            data: ObjectValue::from_value(data),
            state: DocumentState::Synced,
        })
    }

    #[test]
    fn pending_set_overrides_cached_document() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(server_doc("docs/a", 1, json!({"v": "old"})), SnapshotVersion::new(1, 0));
        let mut queue = MemoryMutationQueue::new();
        queue.add_mutation_batch(
            SnapshotVersion::min(),
            vec![],
            vec![Mutation::Set {
                key: key("docs/a"),
                value: ObjectValue::from_value(json!({"v": "new"})),
                precondition: Precondition::None,
            }],
        );
        let doc = get_document(&cache, &queue, &key("docs/a")).unwrap();
        assert!(doc.has_local_mutations());
        assert_eq!(
            doc.as_document().unwrap().data,
            ObjectValue::from_value(json!({"v": "new"}))
        );
    }

    #[test]
    fn query_includes_locally_created_documents() {
        let cache = MemoryRemoteDocumentCache::new();
        let mut queue = MemoryMutationQueue::new();
        queue.add_mutation_batch(
            SnapshotVersion::min(),
            vec![],
            vec![Mutation::Set {
                key: key("docs/new"),
                value: ObjectValue::from_value(json!({"v": 1})),
                precondition: Precondition::None,
            }],
        );
        let query = Query::at_path(ResourcePath::from_string("docs").unwrap());
        let results =
            get_documents_matching_query(&cache, &queue, &query, SnapshotVersion::min());
        assert_eq!(results.len(), 1);
        assert!(results.get(&key("docs/new")).is_some());
    }

    #[test]
    fn query_excludes_locally_deleted_documents() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(server_doc("docs/a", 1, json!({})), SnapshotVersion::new(1, 0));
        let mut queue = MemoryMutationQueue::new();
        queue.add_mutation_batch(
            SnapshotVersion::min(),
            vec![],
            vec![Mutation::Delete {
                key: key("docs/a"),
                precondition: Precondition::None,
            }],
        );
        let query = Query::at_path(ResourcePath::from_string("docs").unwrap());
        let results =
            get_documents_matching_query(&cache, &queue, &query, SnapshotVersion::min());
        assert!(results.is_empty());
    }
}

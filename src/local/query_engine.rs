use crate::core::query::Query;
use crate::core::view_snapshot::DocumentSet;
use crate::local::local_documents_view;
use crate::local::memory_mutation_queue::MemoryMutationQueue;
use crate::local::memory_remote_document_cache::MemoryRemoteDocumentCache;
use crate::local::target_data::TargetData;
use crate::model::collections::{maybe_document_map, DocumentKeySet, MaybeDocumentMap};
use crate::model::document::MaybeDocument;
use crate::model::SnapshotVersion;

/// Evaluates queries against local state, replaying only documents changed
/// since the target's last limbo-free snapshot when that can be proven
/// sufficient, and falling back to a full scan otherwise.
pub fn get_documents_matching_query(
    remote_documents: &MemoryRemoteDocumentCache,
    mutation_queue: &MemoryMutationQueue,
    query: &Query,
    target_data: Option<&TargetData>,
    remote_keys: &DocumentKeySet,
) -> MaybeDocumentMap {
    let limbo_free_version = match target_data {
        // Never synced (or never limbo-free): nothing to replay from.
        None => {
            return execute_full_scan(remote_documents, mutation_queue, query);
        }
        Some(data) if data.last_limbo_free_snapshot_version == SnapshotVersion::min() => {
            return execute_full_scan(remote_documents, mutation_queue, query);
        }
        Some(data) => data.last_limbo_free_snapshot_version,
    };

    let previous_results = apply_query(
        query,
        &local_documents_view::get_documents(remote_documents, mutation_queue, remote_keys),
    );

    if query.limit.is_some() && needs_refill(&previous_results, remote_keys, limbo_free_version) {
        return execute_full_scan(remote_documents, mutation_queue, query);
    }

    log::debug!(
        "re-using previous result from {:?} to execute query: {}",
        limbo_free_version,
        query.canonical_id()
    );

    // Replay only what changed since the limbo-free snapshot on top of the
    // previous results.
    let updated = local_documents_view::get_documents_matching_query(
        remote_documents,
        mutation_queue,
        query,
        limbo_free_version,
    );
    let mut results = maybe_document_map();
    for doc in previous_results.iter() {
        results = results.insert(doc.key.clone(), MaybeDocument::Document(doc.clone()));
    }
    for (key, doc) in updated.iter() {
        results = results.insert(key.clone(), doc.clone());
    }
    results
}

/// Sorts and limits the raw matches the way the view will.
fn apply_query(query: &Query, documents: &MaybeDocumentMap) -> DocumentSet {
    let mut results = DocumentSet::for_query(query);
    for (_, maybe_doc) in documents.iter() {
        if let MaybeDocument::Document(doc) = maybe_doc {
            if query.matches(doc) {
                results = results.add(doc.clone());
            }
        }
    }
    if let Some(limit) = query.limit {
        while results.len() > limit {
            let Some(last) = results.last().cloned() else { break };
            results = results.delete(&last.key);
        }
    }
    results
}

/// A limited query can only reuse previous results when they are provably
/// complete: every synced key still matched, and the document at the limit
/// boundary has not changed since the limbo-free snapshot (otherwise a
/// document outside the cached window may now sort into the result set).
fn needs_refill(
    previous_results: &DocumentSet,
    remote_keys: &DocumentKeySet,
    limbo_free_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != previous_results.len() {
        return true;
    }
    match previous_results.last() {
        None => false,
        Some(edge) => {
            edge.state != crate::model::document::DocumentState::Synced
                || edge.version > limbo_free_version
        }
    }
}

fn execute_full_scan(
    remote_documents: &MemoryRemoteDocumentCache,
    mutation_queue: &MemoryMutationQueue,
    query: &Query,
) -> MaybeDocumentMap {
    log::debug!(
        "using full collection scan to execute query: {}",
        query.canonical_id()
    );
    local_documents_view::get_documents_matching_query(
        remote_documents,
        mutation_queue,
        query,
        SnapshotVersion::min(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::{Direction, OrderBy};
    use crate::core::target_id_generator::TargetIdGenerator;
    use crate::local::target_data::TargetPurpose;
    use crate::model::document::{Document, DocumentState};
    use crate::model::collections::document_key_set;
    use crate::model::object_value::{FieldPath, ObjectValue};
    use crate::model::resource_path::ResourcePath;
    use crate::model::DocumentKey;
    use serde_json::json;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_path_string(path).unwrap()
    }

    fn doc(path: &str, version: i64, rank: i64) -> MaybeDocument {
        MaybeDocument::Document(Document {
            key: key(path),
            version: SnapshotVersion::new(version, 0),
            data: ObjectValue::from_value(json!({ "rank": rank })),
            state: DocumentState::Synced,
        })
    }

    fn limit_query() -> Query {
        Query::at_path(ResourcePath::from_string("docs").unwrap())
            .with_order_by(OrderBy::new(
                FieldPath::from_dot_separated("rank"),
                Direction::Ascending,
            ))
            .with_limit(2)
    }

    fn target_data_with_limbo_free(query: &Query, version: i64) -> TargetData {
        TargetData::new(
            query.to_target(),
            TargetIdGenerator::for_target_cache().next(),
            TargetPurpose::Listen,
            1,
        )
        .with_last_limbo_free_snapshot_version(SnapshotVersion::new(version, 0))
    }

    #[test]
    fn replays_previous_results_when_complete() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(doc("docs/a", 1, 1), SnapshotVersion::new(1, 0));
        cache.add_entry(doc("docs/b", 1, 2), SnapshotVersion::new(1, 0));
        let queue = MemoryMutationQueue::new();
        let query = limit_query();
        let target_data = target_data_with_limbo_free(&query, 5);
        let remote_keys = document_key_set()
            .insert(key("docs/a"))
            .insert(key("docs/b"));
        let results = get_documents_matching_query(
            &cache,
            &queue,
            &query,
            Some(&target_data),
            &remote_keys,
        );
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn falls_back_to_full_scan_when_edge_doc_changed() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(doc("docs/a", 1, 1), SnapshotVersion::new(1, 0));
        // Edge document modified after the limbo-free snapshot.
        cache.add_entry(doc("docs/b", 9, 2), SnapshotVersion::new(9, 0));
        // A third doc that should win a refill.
        cache.add_entry(doc("docs/c", 1, 0), SnapshotVersion::new(1, 0));
        let queue = MemoryMutationQueue::new();
        let query = limit_query();
        let target_data = target_data_with_limbo_free(&query, 5);
        let remote_keys = document_key_set()
            .insert(key("docs/a"))
            .insert(key("docs/b"));
        let results = get_documents_matching_query(
            &cache,
            &queue,
            &query,
            Some(&target_data),
            &remote_keys,
        );
        // Full scan sees docs/c as well.
        assert!(results.get(&key("docs/c")).is_some());
    }

    #[test]
    fn full_scan_without_target_data() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(doc("docs/a", 1, 1), SnapshotVersion::new(1, 0));
        let queue = MemoryMutationQueue::new();
        let query = limit_query();
        let results =
            get_documents_matching_query(&cache, &queue, &query, None, &document_key_set());
        assert_eq!(results.len(), 1);
    }
}

use crate::model::collections::{
    document_version_map, BatchId, DocumentKeySet, DocumentVersionMap, MaybeDocumentMap,
};
use crate::model::document::MaybeDocument;
use crate::model::document_key::DocumentKey;
use crate::model::mutation::{Mutation, MutationResult};
use crate::model::snapshot_version::SnapshotVersion;
use crate::util::assert::hard_assert;
use crate::util::sorted_set::SortedSet;
use bytes::Bytes;

/// An ordered group of mutations committed (or to be committed) as a unit.
///
/// `base_mutations` are synthetic patches capturing pre-images for
/// non-idempotent transforms; they are applied before the user mutations
/// whenever the batch is replayed against cached server state, which keeps
/// repeated replays convergent.
#[derive(Clone, Debug)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: SnapshotVersion,
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: SnapshotVersion,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Every document key touched by this batch.
    pub fn keys(&self) -> DocumentKeySet {
        let mut keys = SortedSet::new();
        for mutation in &self.mutations {
            keys = keys.insert(mutation.key().clone());
        }
        keys
    }

    /// Computes the document state after the server acknowledged this
    /// batch, using the per-mutation results.
    pub fn apply_to_remote_document(
        &self,
        key: &DocumentKey,
        maybe_doc: Option<&MaybeDocument>,
        batch_result: &MutationBatchResult,
    ) -> Option<MaybeDocument> {
        hard_assert(
            batch_result.mutation_results.len() == self.mutations.len(),
            format!(
                "mismatch between mutations ({}) and results ({})",
                self.mutations.len(),
                batch_result.mutation_results.len()
            ),
        );
        let mut current = maybe_doc.cloned();
        for (mutation, result) in self.mutations.iter().zip(&batch_result.mutation_results) {
            if mutation.key() == key {
                current = Some(mutation.apply_to_remote_document(current.as_ref(), result));
            }
        }
        current
    }

    /// Computes the speculative local view of `key` with this batch
    /// applied on top of `maybe_doc`.
    pub fn apply_to_local_view(
        &self,
        key: &DocumentKey,
        maybe_doc: Option<MaybeDocument>,
    ) -> Option<MaybeDocument> {
        let mut current = maybe_doc;
        for mutation in &self.base_mutations {
            if mutation.key() == key {
                current = mutation.apply_to_local_view(current, self.local_write_time);
            }
        }
        for mutation in &self.mutations {
            if mutation.key() == key {
                current = mutation.apply_to_local_view(current, self.local_write_time);
            }
        }
        current
    }

    /// Applies this batch to every document in `document_map` it touches.
    pub fn apply_to_local_document_set(&self, document_map: MaybeDocumentMap) -> MaybeDocumentMap {
        let mut result = document_map;
        let keys = self.keys();
        for key in keys.iter() {
            let previous = result.get(key).cloned();
            if let Some(updated) = self.apply_to_local_view(key, previous) {
                result = result.insert(key.clone(), updated);
            }
        }
        result
    }
}

/// The server's acknowledgement of a batch: commit version, per-mutation
/// results, and the stream token to attach to the next write.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Bytes,
    /// Highest acknowledged version per document, for cache merging.
    pub doc_versions: DocumentVersionMap,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Bytes,
    ) -> Self {
        hard_assert(
            batch.mutations.len() == mutation_results.len(),
            "mutation batch result size does not match batch size",
        );
        let mut doc_versions = document_version_map();
        for (mutation, result) in batch.mutations.iter().zip(&mutation_results) {
            doc_versions = doc_versions.insert(mutation.key().clone(), result.version);
        }
        Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::document::{Document, DocumentState};
    use crate::model::mutation::Precondition;
    use crate::model::object_value::{FieldPath, ObjectValue};
    use serde_json::json;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_path_string(path).unwrap()
    }

    fn set_mutation(path: &str, data: serde_json::Value) -> Mutation {
        Mutation::Set {
            key: key(path),
            value: ObjectValue::from_value(data),
            precondition: Precondition::None,
        }
    }

    fn patch_mutation(path: &str, field: &str, value: serde_json::Value) -> Mutation {
        Mutation::Patch {
            key: key(path),
            data: ObjectValue::from_value(json!({ field: value })),
            field_mask: vec![FieldPath::from_dot_separated(field)],
            precondition: Precondition::Exists(true),
        }
    }

    #[test]
    fn batch_fold_equals_individual_mutation_fold() {
        let batch = MutationBatch::new(
            1,
            SnapshotVersion::min(),
            vec![],
            vec![
                set_mutation("coll/a", json!({"x": 1})),
                patch_mutation("coll/a", "y", json!(2)),
                patch_mutation("coll/a", "x", json!(3)),
            ],
        );

        let via_batch = batch.apply_to_local_view(&key("coll/a"), None).unwrap();

        let mut via_fold: Option<MaybeDocument> = None;
        for mutation in &batch.mutations {
            via_fold = mutation.apply_to_local_view(via_fold, batch.local_write_time);
        }
        assert_eq!(Some(via_batch), via_fold);
    }

    #[test]
    fn batch_only_affects_its_own_keys() {
        let batch = MutationBatch::new(
            1,
            SnapshotVersion::min(),
            vec![],
            vec![set_mutation("coll/a", json!({"x": 1}))],
        );
        let other = MaybeDocument::Document(Document {
            key: key("coll/b"),
            version: SnapshotVersion::new(1, 0),
            data: ObjectValue::from_value(json!({"keep": true})),
            state: DocumentState::Synced,
        });
        let map = crate::model::collections::maybe_document_map()
            .insert(key("coll/b"), other.clone());
        let result = batch.apply_to_local_document_set(map);
        assert_eq!(result.get(&key("coll/b")), Some(&other));
        assert!(result.get(&key("coll/a")).is_some());
    }

    #[test]
    fn batch_result_collects_doc_versions() {
        let batch = MutationBatch::new(
            2,
            SnapshotVersion::min(),
            vec![],
            vec![
                set_mutation("coll/a", json!({})),
                set_mutation("coll/b", json!({})),
            ],
        );
        let results = vec![
            MutationResult {
                version: SnapshotVersion::new(5, 0),
                transform_results: None,
            },
            MutationResult {
                version: SnapshotVersion::new(6, 0),
                transform_results: None,
            },
        ];
        let batch_result =
            MutationBatchResult::from(batch, SnapshotVersion::new(6, 0), results, Bytes::new());
        assert_eq!(
            batch_result.doc_versions.get(&key("coll/a")),
            Some(&SnapshotVersion::new(5, 0))
        );
        assert_eq!(
            batch_result.doc_versions.get(&key("coll/b")),
            Some(&SnapshotVersion::new(6, 0))
        );
    }
}

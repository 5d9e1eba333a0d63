use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::core::query::Query;
use crate::core::target::Target;
use crate::error::{not_found, FirestoreResult};
use crate::local::local_documents_view;
use crate::local::persistence::MemoryPersistence;
use crate::local::query_engine;
use crate::local::target_data::{TargetData, TargetPurpose};
use crate::model::collections::{
    document_key_set, BatchId, DocumentKeySet, MaybeDocumentMap, TargetId,
};
use crate::model::document::MaybeDocument;
use crate::model::mutation::{Mutation, Precondition};
use crate::model::mutation_batch::{MutationBatch, MutationBatchResult};
use crate::model::object_value::field_mask;
use crate::model::{DocumentKey, SnapshotVersion};
use crate::remote::remote_event::RemoteEvent;
use crate::util::assert::hard_assert;

/// Resume tokens are persisted on every event once the previous token is
/// older than this; below the threshold only events that carry document
/// changes update the stored target data.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

/// Result of applying a user write locally.
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: MaybeDocumentMap,
}

/// Result of executing a query against local state.
pub struct QueryResult {
    pub documents: MaybeDocumentMap,
    pub remote_keys: DocumentKeySet,
}

/// Per-target view delta reported back by the sync engine after it raised
/// snapshots, used for reference counting and replay bookkeeping.
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: DocumentKeySet,
    pub removed_keys: DocumentKeySet,
}

/// Single ownership point for all local state: the mutation queue, the
/// remote document cache, and the target cache.
///
/// Every method runs on the engine's task queue, so the store can be
/// mutated without further synchronization.
pub struct LocalStore {
    persistence: MemoryPersistence,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore {
    pub fn new() -> Self {
        Self {
            persistence: MemoryPersistence::new(),
        }
    }

    /// Applies `mutations` optimistically: captures base values for
    /// non-idempotent transforms, persists the batch, and returns the new
    /// local view of the affected documents.
    pub fn write_locally(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = now();
        let mut keys = document_key_set();
        for mutation in &mutations {
            keys = keys.insert(mutation.key().clone());
        }

        let existing = local_documents_view::get_documents(
            &self.persistence.remote_documents,
            &self.persistence.mutation_queue,
            &keys,
        );

        // Non-idempotent transforms (numeric increments) replay against a
        // captured pre-image so retries converge.
        let mut base_mutations = Vec::new();
        for mutation in &mutations {
            if let Some(base_value) = mutation.extract_base_value(existing.get(mutation.key())) {
                let mask = field_mask(&base_value);
                base_mutations.push(Mutation::Patch {
                    key: mutation.key().clone(),
                    data: base_value,
                    field_mask: mask,
                    precondition: Precondition::Exists(true),
                });
            }
        }

        let batch = self.persistence.mutation_queue.add_mutation_batch(
            local_write_time,
            base_mutations,
            mutations,
        );
        let changes = batch.apply_to_local_document_set(existing);
        Ok(LocalWriteResult {
            batch_id: batch.batch_id,
            changes,
        })
    }

    /// Applies an acknowledged batch's effects to the remote document
    /// cache and removes it from the queue.
    pub fn acknowledge_batch(
        &mut self,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<MaybeDocumentMap> {
        let batch = &batch_result.batch;
        let affected_keys = batch.keys();

        for key in affected_keys.iter() {
            let existing = self.persistence.remote_documents.get_entry(key).cloned();
            let ack_version = batch_result.doc_versions.get(key).copied();
            if let Some(ack_version) = ack_version {
                let needs_update = existing
                    .as_ref()
                    .map(|doc| doc.version() < ack_version)
                    .unwrap_or(true);
                if needs_update {
                    if let Some(updated) =
                        batch.apply_to_remote_document(key, existing.as_ref(), batch_result)
                    {
                        self.persistence
                            .remote_documents
                            .add_entry(updated, batch_result.commit_version);
                    }
                }
            }
        }

        self.persistence
            .mutation_queue
            .set_last_stream_token(batch_result.stream_token.clone());
        self.persistence
            .mutation_queue
            .remove_mutation_batch(batch.batch_id);
        self.persistence.mutation_queue.perform_consistency_check();
        self.persistence.collect_garbage(&affected_keys);

        Ok(local_documents_view::get_documents(
            &self.persistence.remote_documents,
            &self.persistence.mutation_queue,
            &affected_keys,
        ))
    }

    /// Discards a rejected batch without touching the remote cache and
    /// returns the local view of the documents it affected.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> FirestoreResult<MaybeDocumentMap> {
        let batch = self
            .persistence
            .mutation_queue
            .lookup_mutation_batch(batch_id)
            .cloned()
            .ok_or_else(|| not_found(format!("rejected batch {batch_id} not found in queue")))?;
        let affected_keys = batch.keys();
        self.persistence.mutation_queue.remove_mutation_batch(batch_id);
        self.persistence.mutation_queue.perform_consistency_check();
        self.persistence.collect_garbage(&affected_keys);
        Ok(local_documents_view::get_documents(
            &self.persistence.remote_documents,
            &self.persistence.mutation_queue,
            &affected_keys,
        ))
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> BatchId {
        self.persistence
            .mutation_queue
            .highest_unacknowledged_batch_id()
    }

    pub fn get_last_stream_token(&self) -> Bytes {
        self.persistence.mutation_queue.last_stream_token()
    }

    pub fn set_last_stream_token(&mut self, token: Bytes) {
        self.persistence.mutation_queue.set_last_stream_token(token);
    }

    pub fn get_last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.persistence.target_cache.last_remote_snapshot_version()
    }

    /// The next batch the write pipeline should send after `batch_id`.
    pub fn next_mutation_batch(&self, after_batch_id: BatchId) -> Option<MutationBatch> {
        self.persistence
            .mutation_queue
            .next_mutation_batch_after_batch_id(after_batch_id)
            .cloned()
    }

    /// Merges one remote event into the caches: target membership and
    /// resume tokens first, then document updates last-writer-wins by
    /// version, then the global snapshot version.
    pub fn apply_remote_event(
        &mut self,
        remote_event: &RemoteEvent,
    ) -> FirestoreResult<MaybeDocumentMap> {
        let event_version = remote_event.snapshot_version;

        for (target_id, change) in remote_event.target_changes.iter() {
            let old_target_data = match self
                .persistence
                .target_cache
                .get_target_data_for_id(*target_id)
                .cloned()
            {
                Some(data) => data,
                // Target released while the event was in flight.
                None => continue,
            };

            self.persistence
                .target_cache
                .remove_matching_keys(&change.removed_documents, *target_id);
            self.persistence
                .target_cache
                .add_matching_keys(&change.added_documents, *target_id);

            if !change.resume_token.is_empty() {
                let new_target_data = old_target_data
                    .clone()
                    .with_resume_token(change.resume_token.clone(), event_version);
                if should_persist_target_data(&old_target_data, &new_target_data, change) {
                    self.persistence
                        .target_cache
                        .update_target_data(new_target_data);
                }
            }
        }

        let mut changed_keys = document_key_set();
        for (key, doc) in remote_event.document_updates.iter() {
            let existing = self.persistence.remote_documents.get_entry(key);
            let should_apply = match existing {
                None => true,
                Some(existing_doc) => {
                    doc.version() > existing_doc.version()
                        || (doc.version() == existing_doc.version()
                            && existing_doc.has_pending_writes())
                        // Deletes manufactured to settle an unresolvable
                        // limbo document carry no version and always win.
                        || doc.version() == SnapshotVersion::min()
                }
            };
            if should_apply {
                self.persistence
                    .remote_documents
                    .add_entry(doc.clone(), event_version);
                changed_keys = changed_keys.insert(key.clone());
            } else {
                log::debug!(
                    "ignoring outdated watch update for {key}; current version: {:?}, watch version: {:?}",
                    existing.map(|d| d.version()),
                    doc.version()
                );
            }
        }
        self.persistence
            .collect_garbage(&remote_event.resolved_limbo_documents);

        if event_version != SnapshotVersion::min() {
            let last_version = self.persistence.target_cache.last_remote_snapshot_version();
            hard_assert(
                event_version >= last_version,
                "watch stream reverted to previous snapshot version",
            );
            self.persistence
                .target_cache
                .set_last_remote_snapshot_version(event_version);
        }

        Ok(local_documents_view::get_documents(
            &self.persistence.remote_documents,
            &self.persistence.mutation_queue,
            &changed_keys,
        ))
    }

    /// Records which documents each view gained or lost, updating GC
    /// references and, for fully synced views, the limbo-free replay
    /// version.
    pub fn notify_local_view_changes(&mut self, view_changes: Vec<LocalViewChanges>) {
        for change in view_changes {
            for key in change.added_keys.iter() {
                self.persistence
                    .add_view_reference(key.clone(), change.target_id);
            }
            for key in change.removed_keys.iter() {
                self.persistence.remove_view_reference(key, change.target_id);
            }
            self.persistence.collect_garbage(&change.removed_keys);

            if !change.from_cache {
                if let Some(target_data) = self
                    .persistence
                    .target_cache
                    .get_target_data_for_id(change.target_id)
                    .cloned()
                {
                    // A view consistent with the server marks its replay
                    // checkpoint.
                    let last_version =
                        self.persistence.target_cache.last_remote_snapshot_version();
                    self.persistence.target_cache.update_target_data(
                        target_data.with_last_limbo_free_snapshot_version(last_version),
                    );
                }
            }
        }
    }

    /// Returns (allocating if needed) target data for `target`.
    pub fn allocate_target(&mut self, target: Target) -> FirestoreResult<TargetData> {
        if let Some(cached) = self.persistence.target_cache.get_target_data(&target) {
            return Ok(cached.clone());
        }
        let target_id = self.persistence.target_cache.allocate_target_id();
        let sequence_number = self.persistence.target_cache.next_sequence_number();
        let target_data = TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number);
        self.persistence.target_cache.add_target_data(target_data.clone());
        Ok(target_data)
    }

    /// Drops a target and garbage-collects documents only it referenced.
    pub fn release_target(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        let keys = self
            .persistence
            .target_cache
            .matching_keys_for_target_id(target_id);
        self.persistence.target_cache.remove_target_data(target_id);
        self.persistence.collect_garbage(&keys);
        Ok(())
    }

    pub fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        self.persistence.target_cache.get_target_data(target).cloned()
    }

    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> QueryResult {
        let target = query.to_target();
        let target_data = self.persistence.target_cache.get_target_data(&target);
        let remote_keys = target_data
            .map(|data| {
                self.persistence
                    .target_cache
                    .matching_keys_for_target_id(data.target_id)
            })
            .unwrap_or_else(document_key_set);
        let documents = query_engine::get_documents_matching_query(
            &self.persistence.remote_documents,
            &self.persistence.mutation_queue,
            query,
            if use_previous_results {
                target_data
            } else {
                None
            },
            &remote_keys,
        );
        QueryResult {
            documents,
            remote_keys,
        }
    }

    /// The current local view of one document.
    pub fn read_document(&self, key: &DocumentKey) -> Option<MaybeDocument> {
        local_documents_view::get_document(
            &self.persistence.remote_documents,
            &self.persistence.mutation_queue,
            key,
        )
    }
}

fn now() -> SnapshotVersion {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => SnapshotVersion::new(elapsed.as_secs() as i64, elapsed.subsec_nanos()),
        Err(_) => SnapshotVersion::min(),
    }
}

/// Bounds write amplification from resume-token churn: persist only when
/// the token is stale enough or the event actually moved documents.
fn should_persist_target_data(
    old_target_data: &TargetData,
    new_target_data: &TargetData,
    change: &crate::remote::remote_event::TargetChange,
) -> bool {
    if new_target_data.resume_token.is_empty() {
        return false;
    }
    if old_target_data.resume_token.is_empty() {
        return true;
    }
    let time_delta = new_target_data.snapshot_version.to_micros()
        - old_target_data.snapshot_version.to_micros();
    if time_delta >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    let changes = change.added_documents.len()
        + change.modified_documents.len()
        + change.removed_documents.len();
    changes > 0
}

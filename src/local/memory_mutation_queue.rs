use bytes::Bytes;

use crate::model::collections::{BatchId, DocumentKeySet};
use crate::model::mutation::Mutation;
use crate::model::mutation_batch::MutationBatch;
use crate::model::{DocumentKey, SnapshotVersion};
use crate::core::query::Query;
use crate::local::reference_set::ReferenceSet;
use crate::util::assert::hard_assert;

/// In-memory queue of pending mutation batches, in batch-id order.
///
/// Batches are acknowledged or rejected strictly from the front; the
/// by-key reference set exists so local-view computation can find the
/// batches affecting a document without scanning the whole queue.
pub struct MemoryMutationQueue {
    queue: Vec<MutationBatch>,
    next_batch_id: BatchId,
    last_stream_token: Bytes,
    batches_by_document_key: ReferenceSet,
}

impl Default for MemoryMutationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self {
            queue: Vec::new(),
            next_batch_id: 1,
            last_stream_token: Bytes::new(),
            batches_by_document_key: ReferenceSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn last_stream_token(&self) -> Bytes {
        self.last_stream_token.clone()
    }

    pub fn set_last_stream_token(&mut self, token: Bytes) {
        self.last_stream_token = token;
    }

    pub fn add_mutation_batch(
        &mut self,
        local_write_time: SnapshotVersion,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        hard_assert(!mutations.is_empty(), "mutation batches must not be empty");
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        if let Some(last) = self.queue.last() {
            hard_assert(
                last.batch_id < batch_id,
                "mutation batch ids must be monotonically increasing",
            );
        }
        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for mutation in &batch.mutations {
            self.batches_by_document_key
                .add_reference(mutation.key().clone(), batch_id);
        }
        self.queue.push(batch.clone());
        batch
    }

    pub fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.queue.iter().find(|b| b.batch_id == batch_id)
    }

    /// The next batch the write pipeline should send, after `batch_id`.
    pub fn next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.queue.iter().find(|b| b.batch_id > batch_id)
    }

    pub fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.next_batch_id - 1
    }

    pub fn all_mutation_batches_affecting_document_key(
        &self,
        key: &DocumentKey,
    ) -> Vec<MutationBatch> {
        let mut result = Vec::new();
        for batch in &self.queue {
            if batch.mutations.iter().any(|m| m.key() == key) {
                result.push(batch.clone());
            }
        }
        result
    }

    pub fn all_mutation_batches_affecting_document_keys(
        &self,
        keys: &DocumentKeySet,
    ) -> Vec<MutationBatch> {
        self.queue
            .iter()
            .filter(|batch| batch.mutations.iter().any(|m| keys.contains(m.key())))
            .cloned()
            .collect()
    }

    /// Batches touching any document directly under the query's path.
    pub fn all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch> {
        self.queue
            .iter()
            .filter(|batch| {
                batch.mutations.iter().any(|m| {
                    let path = m.key().path();
                    if let Some(group) = &query.collection_group {
                        m.key().collection_id() == group && query.path.is_prefix_of(path)
                    } else {
                        query.path.is_immediate_parent_of(path)
                    }
                })
            })
            .cloned()
            .collect()
    }

    /// Removes an acknowledged or rejected batch. Batches leave the queue
    /// strictly in order.
    pub fn remove_mutation_batch(&mut self, batch_id: BatchId) {
        hard_assert(!self.queue.is_empty(), "cannot remove from an empty queue");
        hard_assert(
            self.queue[0].batch_id == batch_id,
            "can only remove the first entry of the mutation queue",
        );
        let batch = self.queue.remove(0);
        for mutation in &batch.mutations {
            self.batches_by_document_key
                .remove_reference(mutation.key(), batch.batch_id);
        }
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batches_by_document_key.contains_key(key)
    }

    /// An empty queue must hold no stale key references.
    pub fn perform_consistency_check(&self) {
        if self.queue.is_empty() {
            hard_assert(
                self.batches_by_document_key.is_empty(),
                "document leak: empty mutation queue still references documents",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mutation::Precondition;
    use crate::model::object_value::ObjectValue;
    use serde_json::json;

    fn set(path: &str) -> Mutation {
        Mutation::Set {
            key: DocumentKey::from_path_string(path).unwrap(),
            value: ObjectValue::from_value(json!({"x": 1})),
            precondition: Precondition::None,
        }
    }

    fn add(queue: &mut MemoryMutationQueue, paths: &[&str]) -> MutationBatch {
        queue.add_mutation_batch(
            SnapshotVersion::min(),
            vec![],
            paths.iter().map(|p| set(p)).collect(),
        )
    }

    #[test]
    fn batch_ids_increase() {
        let mut queue = MemoryMutationQueue::new();
        let b1 = add(&mut queue, &["docs/a"]);
        let b2 = add(&mut queue, &["docs/b"]);
        assert!(b2.batch_id > b1.batch_id);
        assert_eq!(queue.highest_unacknowledged_batch_id(), b2.batch_id);
    }

    #[test]
    fn finds_batches_by_key() {
        let mut queue = MemoryMutationQueue::new();
        add(&mut queue, &["docs/a"]);
        add(&mut queue, &["docs/b"]);
        add(&mut queue, &["docs/a", "docs/c"]);
        let affecting = queue
            .all_mutation_batches_affecting_document_key(
                &DocumentKey::from_path_string("docs/a").unwrap(),
            );
        assert_eq!(affecting.len(), 2);
    }

    #[test]
    fn removal_is_fifo_and_checks_consistency() {
        let mut queue = MemoryMutationQueue::new();
        let b1 = add(&mut queue, &["docs/a"]);
        let b2 = add(&mut queue, &["docs/b"]);
        queue.remove_mutation_batch(b1.batch_id);
        queue.remove_mutation_batch(b2.batch_id);
        queue.perform_consistency_check();
        assert!(queue.is_empty());
    }

    #[test]
    #[should_panic(expected = "first entry")]
    fn out_of_order_removal_panics() {
        let mut queue = MemoryMutationQueue::new();
        add(&mut queue, &["docs/a"]);
        let b2 = add(&mut queue, &["docs/b"]);
        queue.remove_mutation_batch(b2.batch_id);
    }
}

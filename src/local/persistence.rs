use crate::local::memory_mutation_queue::MemoryMutationQueue;
use crate::local::memory_remote_document_cache::MemoryRemoteDocumentCache;
use crate::local::memory_target_cache::MemoryTargetCache;
use crate::local::reference_set::ReferenceSet;
use crate::model::collections::DocumentKeySet;
use crate::model::DocumentKey;

/// Owns the in-memory caches and applies the eager garbage-collection
/// policy: a cached document survives only while a target, a pending
/// mutation, or a live local view references it.
pub struct MemoryPersistence {
    pub mutation_queue: MemoryMutationQueue,
    pub remote_documents: MemoryRemoteDocumentCache,
    pub target_cache: MemoryTargetCache,
    /// References held by live views (limbo tracking and listeners),
    /// reported through `notify_local_view_changes`.
    additional_references: ReferenceSet,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            mutation_queue: MemoryMutationQueue::new(),
            remote_documents: MemoryRemoteDocumentCache::new(),
            target_cache: MemoryTargetCache::new(),
            additional_references: ReferenceSet::new(),
        }
    }

    pub fn add_view_reference(&mut self, key: DocumentKey, target_id: i32) {
        self.additional_references.add_reference(key, target_id);
    }

    pub fn remove_view_reference(&mut self, key: &DocumentKey, target_id: i32) {
        self.additional_references.remove_reference(key, target_id);
    }

    fn is_referenced(&self, key: &DocumentKey) -> bool {
        self.target_cache.contains_key(key)
            || self.mutation_queue.contains_key(key)
            || self.additional_references.contains_key(key)
    }

    /// Eagerly drops every document in `keys` that nothing references
    /// anymore.
    pub fn collect_garbage(&mut self, keys: &DocumentKeySet) {
        for key in keys.iter() {
            if !self.is_referenced(key) {
                self.remote_documents.remove_entry(key);
            }
        }
    }
}

use std::collections::HashMap;

use crate::core::target::Target;
use crate::core::target_id_generator::TargetIdGenerator;
use crate::local::reference_set::ReferenceSet;
use crate::local::target_data::TargetData;
use crate::model::collections::{DocumentKeySet, ListenSequenceNumber, TargetId};
use crate::model::{DocumentKey, SnapshotVersion};
use crate::util::assert::hard_assert;

/// In-memory cache of allocated targets, keyed both by canonical target
/// id and by numeric target id, plus the key-to-target reference index.
pub struct MemoryTargetCache {
    /// Canonical target id string -> target data.
    targets: HashMap<String, TargetData>,
    targets_by_id: HashMap<TargetId, TargetData>,
    references: ReferenceSet,
    id_generator: TargetIdGenerator,
    highest_sequence_number: ListenSequenceNumber,
    last_remote_snapshot_version: SnapshotVersion,
}

impl Default for MemoryTargetCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self {
            targets: HashMap::new(),
            targets_by_id: HashMap::new(),
            references: ReferenceSet::new(),
            id_generator: TargetIdGenerator::for_target_cache(),
            highest_sequence_number: 0,
            last_remote_snapshot_version: SnapshotVersion::min(),
        }
    }

    pub fn allocate_target_id(&mut self) -> TargetId {
        self.id_generator.next()
    }

    pub fn next_sequence_number(&mut self) -> ListenSequenceNumber {
        self.highest_sequence_number += 1;
        self.highest_sequence_number
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    pub fn set_last_remote_snapshot_version(&mut self, version: SnapshotVersion) {
        self.last_remote_snapshot_version = version;
    }

    pub fn add_target_data(&mut self, target_data: TargetData) {
        let canonical = target_data.target.canonical_id();
        hard_assert(
            !self.targets.contains_key(&canonical),
            "adding a target that is already cached",
        );
        self.targets_by_id
            .insert(target_data.target_id, target_data.clone());
        self.targets.insert(canonical, target_data);
    }

    pub fn update_target_data(&mut self, target_data: TargetData) {
        let canonical = target_data.target.canonical_id();
        self.targets_by_id
            .insert(target_data.target_id, target_data.clone());
        self.targets.insert(canonical, target_data);
    }

    pub fn remove_target_data(&mut self, target_id: TargetId) {
        if let Some(target_data) = self.targets_by_id.remove(&target_id) {
            self.targets.remove(&target_data.target.canonical_id());
        }
        self.references.remove_references_for_id(target_id);
    }

    pub fn get_target_data(&self, target: &Target) -> Option<&TargetData> {
        self.targets.get(&target.canonical_id())
    }

    pub fn get_target_data_for_id(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets_by_id.get(&target_id)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn add_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        self.references.add_references(keys, target_id);
    }

    pub fn remove_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        self.references.remove_references(keys, target_id);
    }

    pub fn matching_keys_for_target_id(&self, target_id: TargetId) -> DocumentKeySet {
        self.references.references_for_id(target_id)
    }

    /// Whether any target still references `key`; used by eager GC.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::target_data::TargetPurpose;
    use crate::model::resource_path::ResourcePath;

    fn target(path: &str) -> Target {
        Target {
            path: ResourcePath::from_string(path).unwrap(),
            collection_group: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    #[test]
    fn allocates_even_target_ids() {
        let mut cache = MemoryTargetCache::new();
        assert_eq!(cache.allocate_target_id(), 2);
        assert_eq!(cache.allocate_target_id(), 4);
    }

    #[test]
    fn add_lookup_remove_round_trip() {
        let mut cache = MemoryTargetCache::new();
        let id = cache.allocate_target_id();
        let seq = cache.next_sequence_number();
        let data = TargetData::new(target("docs"), id, TargetPurpose::Listen, seq);
        cache.add_target_data(data);
        assert!(cache.get_target_data(&target("docs")).is_some());
        assert!(cache.get_target_data_for_id(id).is_some());
        cache.remove_target_data(id);
        assert!(cache.get_target_data(&target("docs")).is_none());
        assert_eq!(cache.target_count(), 0);
    }

    #[test]
    fn tracks_matching_keys() {
        let mut cache = MemoryTargetCache::new();
        let key = DocumentKey::from_path_string("docs/a").unwrap();
        let keys = crate::model::collections::document_key_set().insert(key.clone());
        cache.add_matching_keys(&keys, 2);
        assert!(cache.contains_key(&key));
        assert_eq!(cache.matching_keys_for_target_id(2).len(), 1);
        cache.remove_matching_keys(&keys, 2);
        assert!(!cache.contains_key(&key));
    }
}

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::local::target_data::{TargetData, TargetPurpose};
use crate::model::collections::{
    document_key_set, maybe_document_map, DocumentKeySet, MaybeDocumentMap, TargetId,
};
use crate::model::document::{MaybeDocument, NoDocument};
use crate::model::{DocumentKey, SnapshotVersion};
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};
use crate::util::assert::hard_assert;
use crate::util::sorted_map::SortedMap;
use crate::util::sorted_set::SortedSet;

/// Lets the aggregator look up what the engine already knows about a
/// target: the documents the server previously confirmed for it, and
/// whether the target is still active.
#[async_trait]
pub trait TargetMetadataProvider: Send + Sync {
    async fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;
    async fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DocumentChangeKind {
    Added,
    Modified,
    Removed,
}

/// Accumulated watch state for one target between remote events.
struct TargetState {
    /// Outstanding add/remove requests for this target; responses for a
    /// target with pending requests belong to an obsolete listen and are
    /// not surfaced.
    pending_responses: i32,
    current: bool,
    resume_token: Bytes,
    /// Set on creation so the first snapshot always includes this target,
    /// even if no documents changed.
    has_pending_changes: bool,
    document_changes: BTreeMap<DocumentKey, DocumentChangeKind>,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            current: false,
            resume_token: Bytes::new(),
            has_pending_changes: true,
            document_changes: BTreeMap::new(),
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses > 0
    }

    /// Empty resume tokens are a server shorthand for "unchanged" and are
    /// never stored.
    fn update_resume_token(&mut self, token: &Bytes) {
        if !token.is_empty() {
            self.resume_token = token.clone();
            self.has_pending_changes = true;
        }
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
    }

    fn mark_current(&mut self) {
        self.current = true;
        self.has_pending_changes = true;
    }

    fn add_document_change(&mut self, key: DocumentKey, kind: DocumentChangeKind) {
        self.document_changes.insert(key, kind);
        self.has_pending_changes = true;
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.document_changes.remove(key);
        self.has_pending_changes = true;
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn to_target_change(&self) -> TargetChange {
        let mut added = document_key_set();
        let mut modified = document_key_set();
        let mut removed = document_key_set();
        for (key, kind) in &self.document_changes {
            match kind {
                DocumentChangeKind::Added => added = added.insert(key.clone()),
                DocumentChangeKind::Modified => modified = modified.insert(key.clone()),
                DocumentChangeKind::Removed => removed = removed.insert(key.clone()),
            }
        }
        TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            added_documents: added,
            modified_documents: modified,
            removed_documents: removed,
        }
    }
}

/// Folds individual watch changes into per-target state until a
/// consistent snapshot version arrives, then materializes the whole
/// accumulation as one [`RemoteEvent`].
pub struct WatchChangeAggregator {
    metadata_provider: Arc<dyn TargetMetadataProvider>,
    target_states: HashMap<TargetId, TargetState>,
    pending_document_updates: MaybeDocumentMap,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    /// Targets whose existence filter disagreed with our local view; the
    /// sync layer must re-listen to them from scratch.
    pending_target_resets: SortedSet<TargetId>,
}

impl WatchChangeAggregator {
    pub fn new(metadata_provider: Arc<dyn TargetMetadataProvider>) -> Self {
        Self {
            metadata_provider,
            target_states: HashMap::new(),
            pending_document_updates: maybe_document_map(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: SortedSet::new(),
        }
    }

    /// Records that a watch request for `target_id` is on the wire, so
    /// responses from an earlier listen of the same id can be told apart.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).record_pending_target_request();
    }

    pub async fn handle_document_change(&mut self, change: DocumentWatchChange) {
        for target_id in &change.updated_target_ids {
            if let Some(doc @ MaybeDocument::Document(_)) = &change.new_doc {
                self.add_document_to_target(*target_id, doc.clone()).await;
            } else {
                self.remove_document_from_target(*target_id, &change.key, change.new_doc.clone())
                    .await;
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, &change.key, change.new_doc.clone())
                .await;
        }
    }

    pub async fn handle_target_change(&mut self, change: WatchTargetChange) {
        for target_id in self.targets_for_change(&change) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(target_id).await {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    // Removals with an error cause are handled upstream;
                    // here a removal just acknowledges our unlisten.
                    hard_assert(
                        change.cause.is_none(),
                        "watch target removal with a cause reached the aggregator",
                    );
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(target_id).await {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(target_id).await {
                        self.reset_target(target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Checks the server's count of matching documents against ours. On a
    /// mismatch the local results cannot be trusted, so the target's
    /// accumulated state is dropped and it is queued for a full re-listen.
    pub async fn handle_existence_filter(&mut self, change: ExistenceFilterChange) {
        let target_id = change.target_id;
        if !self.is_active_target(target_id).await {
            return;
        }
        let Some(target_data) = self
            .metadata_provider
            .get_target_data_for_target(target_id)
            .await
        else {
            return;
        };

        if target_data.target.is_document_target() {
            if change.count == 0 {
                // The document no longer exists server-side; synthesize
                // the delete the watch stream did not send.
                let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) else {
                    return;
                };
                let deleted = MaybeDocument::NoDocument(NoDocument {
                    key: key.clone(),
                    version: SnapshotVersion::min(),
                    has_committed_mutations: false,
                });
                self.remove_document_from_target(target_id, &key, Some(deleted)).await;
            } else {
                hard_assert(change.count == 1, "single document target with more than one document");
            }
        } else {
            let current_size = self.current_document_count_for_target(target_id).await;
            if current_size != change.count {
                self.reset_target(target_id);
                self.pending_target_resets = self.pending_target_resets.insert(target_id);
            }
        }
    }

    /// Converts everything accumulated so far into a remote event at
    /// `snapshot_version` and resets the accumulation state.
    pub async fn create_remote_event(&mut self, snapshot_version: SnapshotVersion) -> RemoteEvent {
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        let mut target_changes: SortedMap<TargetId, TargetChange> = SortedMap::new();

        for target_id in target_ids {
            if !self.is_active_target(target_id).await {
                continue;
            }

            // A document target that is current but never produced its
            // document means the document was deleted before we listened;
            // surface that as a delete so limbo resolution converges.
            let synthesize_delete = {
                let Some(state) = self.target_states.get(&target_id) else { continue };
                state.current
            };
            if synthesize_delete {
                if let Some(target_data) = self
                    .metadata_provider
                    .get_target_data_for_target(target_id)
                    .await
                {
                    if target_data.target.is_document_target() {
                        if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                            let seen = self.pending_document_updates.contains_key(&key)
                                || self.target_contains_document(target_id, &key).await;
                            if !seen {
                                let deleted = MaybeDocument::NoDocument(NoDocument {
                                    key: key.clone(),
                                    version: snapshot_version,
                                    has_committed_mutations: false,
                                });
                                self.remove_document_from_target(target_id, &key, Some(deleted))
                                    .await;
                            }
                        }
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes = target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        // Documents seen only by limbo-resolution targets are fully
        // resolved by this snapshot.
        let mut resolved_limbo_documents = document_key_set();
        for (key, targets) in &self.pending_document_target_mapping {
            let mut only_limbo = true;
            for target_id in targets {
                if let Some(target_data) = self
                    .metadata_provider
                    .get_target_data_for_target(*target_id)
                    .await
                {
                    if target_data.purpose != TargetPurpose::LimboResolution {
                        only_limbo = false;
                        break;
                    }
                }
            }
            if only_limbo {
                resolved_limbo_documents = resolved_limbo_documents.insert(key.clone());
            }
        }

        let event = RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: self.pending_target_resets.clone(),
            document_updates: self.pending_document_updates.clone(),
            resolved_limbo_documents,
        };
        self.pending_document_updates = maybe_document_map();
        self.pending_document_target_mapping = BTreeMap::new();
        self.pending_target_resets = SortedSet::new();
        event
    }

    async fn add_document_to_target(&mut self, target_id: TargetId, doc: MaybeDocument) {
        if !self.is_active_target(target_id).await {
            return;
        }
        let key = doc.key().clone();
        let kind = if self.target_contains_document(target_id, &key).await {
            DocumentChangeKind::Modified
        } else {
            DocumentChangeKind::Added
        };
        self.ensure_target_state(target_id).add_document_change(key.clone(), kind);
        self.pending_document_updates = self.pending_document_updates.insert(key.clone(), doc);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    async fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_doc: Option<MaybeDocument>,
    ) {
        if !self.is_active_target(target_id).await {
            return;
        }
        if self.target_contains_document(target_id, key).await {
            self.ensure_target_state(target_id)
                .add_document_change(key.clone(), DocumentChangeKind::Removed);
        } else {
            // The document was added and removed within the same snapshot;
            // drop the change entirely.
            self.ensure_target_state(target_id).remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(doc) = updated_doc {
            self.pending_document_updates = self.pending_document_updates.insert(key.clone(), doc);
        }
    }

    /// Number of documents the target would match right now: what the
    /// server confirmed previously, adjusted by this snapshot's adds and
    /// removes.
    async fn current_document_count_for_target(&mut self, target_id: TargetId) -> usize {
        let remote = self
            .metadata_provider
            .get_remote_keys_for_target(target_id)
            .await
            .len() as i64;
        let state = self.ensure_target_state(target_id);
        let mut count = remote;
        for kind in state.document_changes.values() {
            match kind {
                DocumentChangeKind::Added => count += 1,
                DocumentChangeKind::Removed => count -= 1,
                DocumentChangeKind::Modified => {}
            }
        }
        count.max(0) as usize
    }

    async fn target_contains_document(&self, target_id: TargetId, key: &DocumentKey) -> bool {
        self.metadata_provider
            .get_remote_keys_for_target(target_id)
            .await
            .contains(key)
    }

    /// A target is active while the sync layer still has a listen for it
    /// and we are not waiting on responses to our own add/remove requests.
    async fn is_active_target(&self, target_id: TargetId) -> bool {
        let pending = self
            .target_states
            .get(&target_id)
            .map(TargetState::is_pending)
            .unwrap_or(false);
        !pending
            && self
                .metadata_provider
                .get_target_data_for_target(target_id)
                .await
                .is_some()
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_insert_with(TargetState::new)
    }

    /// Drops all accumulated state for a target the server rejected.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn reset_target(&mut self, target_id: TargetId) {
        // Keep pending-response accounting; drop everything else and mark
        // the target as needing a fresh snapshot.
        let pending = self
            .target_states
            .get(&target_id)
            .map(|s| s.pending_responses)
            .unwrap_or(0);
        let mut state = TargetState::new();
        state.pending_responses = pending;
        self.target_states.insert(target_id, state);
    }

    fn targets_for_change(&self, change: &WatchTargetChange) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            change.target_ids.clone()
        } else {
            self.target_states.keys().copied().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::target::Target;
    use crate::model::document::{Document, DocumentState};
    use crate::model::object_value::ObjectValue;
    use async_lock::Mutex;
    use serde_json::json;

    struct FakeMetadata {
        targets: Mutex<HashMap<TargetId, TargetData>>,
        remote_keys: Mutex<HashMap<TargetId, DocumentKeySet>>,
    }

    impl FakeMetadata {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                targets: Mutex::new(HashMap::new()),
                remote_keys: Mutex::new(HashMap::new()),
            })
        }

        async fn add_target(&self, target_id: TargetId, path: &str, purpose: TargetPurpose) {
            let target = Target {
                path: crate::model::ResourcePath::from_string(path).unwrap(),
                collection_group: None,
                filters: Vec::new(),
                order_by: Vec::new(),
                limit: None,
                start_at: None,
                end_at: None,
            };
            self.targets
                .lock()
                .await
                .insert(target_id, TargetData::new(target, target_id, purpose, 1));
        }
    }

    #[async_trait]
    impl TargetMetadataProvider for FakeMetadata {
        async fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
            self.remote_keys
                .lock()
                .await
                .get(&target_id)
                .cloned()
                .unwrap_or_else(document_key_set)
        }

        async fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.lock().await.get(&target_id).cloned()
        }
    }

    fn doc(path: &str, version: i64) -> MaybeDocument {
        MaybeDocument::Document(Document {
            key: DocumentKey::from_path_string(path).unwrap(),
            version: SnapshotVersion::new(version, 0),
            data: ObjectValue::from_value(json!({"v": version})),
            state: DocumentState::Synced,
        })
    }

    #[tokio::test]
    async fn document_changes_accumulate_per_target() {
        let metadata = FakeMetadata::new();
        metadata.add_target(2, "rooms", TargetPurpose::Listen).await;
        let mut aggregator = WatchChangeAggregator::new(metadata.clone());

        aggregator
            .handle_document_change(DocumentWatchChange {
                updated_target_ids: vec![2],
                removed_target_ids: vec![],
                key: DocumentKey::from_path_string("rooms/a").unwrap(),
                new_doc: Some(doc("rooms/a", 1)),
            })
            .await;
        aggregator
            .handle_target_change(WatchTargetChange::new(
                WatchTargetChangeState::Current,
                vec![2],
            ))
            .await;

        let event = aggregator.create_remote_event(SnapshotVersion::new(1, 0)).await;
        let change = event.target_changes.get(&2).cloned().unwrap();
        assert!(change.current);
        assert_eq!(change.added_documents.len(), 1);
        assert_eq!(event.document_updates.len(), 1);
    }

    #[tokio::test]
    async fn changes_for_inactive_targets_are_dropped() {
        let metadata = FakeMetadata::new();
        let mut aggregator = WatchChangeAggregator::new(metadata.clone());

        aggregator
            .handle_document_change(DocumentWatchChange {
                updated_target_ids: vec![4],
                removed_target_ids: vec![],
                key: DocumentKey::from_path_string("rooms/a").unwrap(),
                new_doc: Some(doc("rooms/a", 1)),
            })
            .await;
        let event = aggregator.create_remote_event(SnapshotVersion::new(1, 0)).await;
        assert!(event.target_changes.is_empty());
        assert!(event.document_updates.is_empty());
    }

    #[tokio::test]
    async fn existence_filter_mismatch_queues_a_reset() {
        let metadata = FakeMetadata::new();
        metadata.add_target(2, "rooms", TargetPurpose::Listen).await;
        let mut aggregator = WatchChangeAggregator::new(metadata.clone());

        // Server claims one matching document, we know of none.
        aggregator
            .handle_existence_filter(ExistenceFilterChange {
                target_id: 2,
                count: 1,
            })
            .await;
        let event = aggregator.create_remote_event(SnapshotVersion::new(1, 0)).await;
        assert!(event.target_mismatches.contains(&2));
    }

    #[tokio::test]
    async fn current_document_target_without_its_document_synthesizes_a_delete() {
        let metadata = FakeMetadata::new();
        metadata
            .add_target(1, "rooms/gone", TargetPurpose::LimboResolution)
            .await;
        let mut aggregator = WatchChangeAggregator::new(metadata.clone());

        aggregator
            .handle_target_change(WatchTargetChange::new(
                WatchTargetChangeState::Current,
                vec![1],
            ))
            .await;
        let event = aggregator.create_remote_event(SnapshotVersion::new(2, 0)).await;

        let key = DocumentKey::from_path_string("rooms/gone").unwrap();
        match event.document_updates.get(&key) {
            Some(MaybeDocument::NoDocument(no_doc)) => {
                assert_eq!(no_doc.version, SnapshotVersion::new(2, 0));
            }
            other => panic!("expected a synthesized delete, got {other:?}"),
        }
        assert!(event.resolved_limbo_documents.contains(&key));
    }

    #[tokio::test]
    async fn add_then_remove_in_one_snapshot_cancels_out() {
        let metadata = FakeMetadata::new();
        metadata.add_target(2, "rooms", TargetPurpose::Listen).await;
        let mut aggregator = WatchChangeAggregator::new(metadata.clone());

        let key = DocumentKey::from_path_string("rooms/a").unwrap();
        aggregator
            .handle_document_change(DocumentWatchChange {
                updated_target_ids: vec![2],
                removed_target_ids: vec![],
                key: key.clone(),
                new_doc: Some(doc("rooms/a", 1)),
            })
            .await;
        aggregator
            .handle_document_change(DocumentWatchChange {
                updated_target_ids: vec![],
                removed_target_ids: vec![2],
                key: key.clone(),
                new_doc: None,
            })
            .await;

        let event = aggregator.create_remote_event(SnapshotVersion::new(1, 0)).await;
        let change = event.target_changes.get(&2).cloned().unwrap();
        assert!(change.added_documents.is_empty());
        assert!(change.removed_documents.is_empty());
    }
}

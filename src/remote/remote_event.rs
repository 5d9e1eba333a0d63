use bytes::Bytes;

use crate::model::collections::{
    document_key_set, maybe_document_map, DocumentKeySet, MaybeDocumentMap, TargetId,
};
use crate::model::SnapshotVersion;
use crate::util::sorted_map::SortedMap;
use crate::util::sorted_set::SortedSet;

/// The changes one remote event implies for a single target.
#[derive(Clone, Debug)]
pub struct TargetChange {
    /// Opaque cursor for resuming this target after a disconnect. Empty
    /// means "no new token in this event".
    pub resume_token: Bytes,
    /// Whether the server has confirmed the local state matches the
    /// server state for this target.
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    /// A target change carrying only a `current` flag flip. Used when a
    /// view needs to transition sync state without any server message,
    /// e.g. when raising an initial snapshot from cached data.
    pub fn synthesized_from_current_change(current: bool, resume_token: Bytes) -> Self {
        Self {
            resume_token,
            current,
            added_documents: document_key_set(),
            modified_documents: document_key_set(),
            removed_documents: document_key_set(),
        }
    }
}

/// One atomic unit of server-confirmed state: everything the watch stream
/// reported up to a consistent snapshot version.
#[derive(Clone, Debug)]
pub struct RemoteEvent {
    /// Snapshot version this event brings the client up to.
    pub snapshot_version: SnapshotVersion,
    pub target_changes: SortedMap<TargetId, TargetChange>,
    /// Targets whose existence filter mismatched; they must be re-listened
    /// from scratch.
    pub target_mismatches: SortedSet<TargetId>,
    /// New document states, across all targets.
    pub document_updates: MaybeDocumentMap,
    /// Documents previously in limbo that this event settles.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    pub fn new(
        snapshot_version: SnapshotVersion,
        target_changes: SortedMap<TargetId, TargetChange>,
        target_mismatches: SortedSet<TargetId>,
        document_updates: MaybeDocumentMap,
        resolved_limbo_documents: DocumentKeySet,
    ) -> Self {
        Self {
            snapshot_version,
            target_changes,
            target_mismatches,
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// A synthesized event that marks one document target current with a
    /// single document update. Used to resolve limbo targets whose listen
    /// was rejected.
    pub fn synthesized_document_event(
        target_id: TargetId,
        doc: crate::model::document::MaybeDocument,
    ) -> Self {
        let key = doc.key().clone();
        let target_changes = SortedMap::new().insert(
            target_id,
            TargetChange::synthesized_from_current_change(false, Bytes::new()),
        );
        Self {
            snapshot_version: SnapshotVersion::min(),
            target_changes,
            target_mismatches: SortedSet::new(),
            document_updates: maybe_document_map().insert(key.clone(), doc),
            resolved_limbo_documents: document_key_set().insert(key),
        }
    }
}

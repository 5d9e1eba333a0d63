use crate::model::document::MaybeDocument;
use crate::model::document_key::DocumentKey;
use crate::util::sorted_map::SortedMap;
use crate::util::sorted_set::SortedSet;

/// Identifies a watch target. Even ids are assigned by the target cache
/// for user queries, odd ids by the sync engine for limbo resolution.
pub type TargetId = i32;

/// Identifies a mutation batch; strictly increasing per user.
pub type BatchId = i32;

/// Monotonic sequence number stamped on local-store operations, used by
/// garbage collection.
pub type ListenSequenceNumber = i64;

pub type DocumentKeySet = SortedSet<DocumentKey>;
pub type MaybeDocumentMap = SortedMap<DocumentKey, MaybeDocument>;
pub type DocumentVersionMap = SortedMap<DocumentKey, crate::model::SnapshotVersion>;

pub fn document_key_set() -> DocumentKeySet {
    SortedSet::new()
}

pub fn maybe_document_map() -> MaybeDocumentMap {
    SortedMap::new()
}

pub fn document_version_map() -> DocumentVersionMap {
    SortedMap::new()
}

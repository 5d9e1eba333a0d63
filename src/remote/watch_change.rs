use bytes::Bytes;

use crate::error::FirestoreError;
use crate::model::collections::TargetId;
use crate::model::document::MaybeDocument;
use crate::model::DocumentKey;

/// Target-level state transitions reported on the listen stream.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

/// A target-level watch message: which targets it applies to (empty list
/// means "all active targets"), an optional resume token, and the error
/// that removed the targets, if any.
#[derive(Clone, Debug)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    pub target_ids: Vec<TargetId>,
    pub resume_token: Bytes,
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: WatchTargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Bytes::new(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Bytes) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// A per-document watch message: the new state of one document and the
/// targets it entered or left.
#[derive(Clone, Debug)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    /// `None` when the server only reports target membership removal.
    pub new_doc: Option<MaybeDocument>,
}

/// Server hint of how many documents a target should hold; a mismatch
/// with the local count means a delete was missed.
#[derive(Clone, Copy, Debug)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: usize,
}

/// One raw message from the watch stream, before aggregation.
#[derive(Clone, Debug)]
pub enum WatchChange {
    Document(DocumentWatchChange),
    TargetChange(WatchTargetChange),
    ExistenceFilter(ExistenceFilterChange),
}

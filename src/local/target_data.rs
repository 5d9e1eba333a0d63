use bytes::Bytes;

use crate::core::target::Target;
use crate::model::collections::{ListenSequenceNumber, TargetId};
use crate::model::SnapshotVersion;

/// Why a target is being listened to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TargetPurpose {
    /// A user query.
    Listen,
    /// Re-listen issued after an existence-filter mismatch; must not carry
    /// a resume token so the server resends the full target contents.
    ExistenceFilterMismatch,
    /// Point lookup resolving a limbo document.
    LimboResolution,
}

/// Cached bookkeeping for one allocated target.
#[derive(Clone, Debug)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub sequence_number: ListenSequenceNumber,
    pub purpose: TargetPurpose,
    /// Latest snapshot version the server reported for this target.
    pub snapshot_version: SnapshotVersion,
    /// Latest version at which this target's view had no limbo documents;
    /// query replay can start from here.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Bytes,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            sequence_number,
            purpose,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Bytes::new(),
        }
    }

    pub fn with_resume_token(mut self, resume_token: Bytes, version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = version;
        self
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }
}

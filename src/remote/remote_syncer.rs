use async_trait::async_trait;

use crate::error::{FirestoreError, FirestoreResult};
use crate::model::collections::{BatchId, DocumentKeySet, TargetId};
use crate::model::mutation_batch::MutationBatchResult;
use crate::remote::online_state_tracker::OnlineState;
use crate::remote::remote_event::RemoteEvent;

/// The callbacks the remote layer needs from the sync layer. Implemented
/// by the sync engine and injected after construction, which breaks the
/// reference cycle between the two.
#[async_trait]
pub trait RemoteSyncer: Send + Sync {
    /// Applies one consistent remote event to local state and raises the
    /// resulting snapshots.
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()>;

    /// Handles the server rejecting a listen, e.g. for lack of permission.
    async fn reject_listen(&self, target_id: TargetId, error: FirestoreError)
        -> FirestoreResult<()>;

    /// Applies a server acknowledgement of a mutation batch.
    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()>;

    /// Handles the server permanently rejecting a mutation batch.
    async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError)
        -> FirestoreResult<()>;

    /// Documents the server has confirmed for the target, used to size
    /// existence-filter comparisons.
    async fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// Fans a connectivity change out to every active view.
    async fn handle_online_state_change(&self, state: OnlineState) -> FirestoreResult<()>;
}

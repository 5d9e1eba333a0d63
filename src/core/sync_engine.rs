use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::oneshot;
use log::debug;

use crate::core::query::Query;
use crate::core::target_id_generator::TargetIdGenerator;
use crate::core::view::{LimboDocumentChange, View};
use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::error::{failed_precondition, internal_error, FirestoreError, FirestoreResult};
use crate::local::local_store::{LocalStore, LocalViewChanges};
use crate::local::reference_set::ReferenceSet;
use crate::local::target_data::{TargetData, TargetPurpose};
use crate::model::collections::{
    document_key_set, BatchId, DocumentKeySet, MaybeDocumentMap, TargetId,
};
use crate::model::document::{MaybeDocument, NoDocument};
use crate::model::mutation::Mutation;
use crate::model::mutation_batch::MutationBatchResult;
use crate::model::{DocumentKey, SnapshotVersion};
use crate::remote::online_state_tracker::OnlineState;
use crate::remote::remote_event::RemoteEvent;
use crate::remote::remote_store::RemoteStore;
use crate::remote::remote_syncer::RemoteSyncer;
use crate::util::assert::hard_assert;

/// Default cap on simultaneously active limbo-resolution listens.
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

/// Receives result snapshots and terminal errors for one listened query.
pub trait SnapshotListener: Send + Sync {
    fn on_snapshot(&self, snapshot: ViewSnapshot);
    fn on_error(&self, error: FirestoreError);
}

/// A locally accepted write. `acknowledged` resolves once the server has
/// committed (or permanently rejected) the batch.
pub struct PendingWrite {
    batch_id: BatchId,
    receiver: oneshot::Receiver<FirestoreResult<()>>,
}

impl PendingWrite {
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub async fn acknowledged(self) -> FirestoreResult<()> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(internal_error("write acknowledgement was dropped")),
        }
    }
}

/// One listened query and its view state.
struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
    /// Replayed to listeners that attach after the first snapshot.
    last_snapshot: Option<ViewSnapshot>,
}

/// One in-flight limbo point lookup.
struct LimboResolution {
    key: DocumentKey,
    /// Whether the limbo target has produced any document yet. A target
    /// that goes current without this set proves server-side deletion.
    document_received: bool,
}

enum LimboAction {
    Listen(TargetData),
    Unlisten(TargetId),
}

struct SyncEngineState {
    /// Keyed by canonical query id.
    query_views: HashMap<String, QueryView>,
    queries_by_target: HashMap<TargetId, Vec<Query>>,
    listeners: HashMap<String, Vec<Arc<dyn SnapshotListener>>>,
    limbo_target_id_generator: TargetIdGenerator,
    /// Limbo documents awaiting a free resolution slot, FIFO.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: HashMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: HashMap<TargetId, LimboResolution>,
    /// Which query targets keep which limbo documents alive.
    limbo_document_refs: ReferenceSet,
    mutation_callbacks: HashMap<BatchId, oneshot::Sender<FirestoreResult<()>>>,
    pending_writes_callbacks: HashMap<BatchId, Vec<oneshot::Sender<FirestoreResult<()>>>>,
    online_state: OnlineState,
}

/// Top-level orchestrator: owns the per-query views and limbo
/// bookkeeping, and mediates every flow between user calls, the local
/// store and the remote store.
///
/// All entry points are expected to run on the engine queue.
pub struct SyncEngine {
    local_store: Arc<Mutex<LocalStore>>,
    remote_store: Arc<RemoteStore>,
    max_concurrent_limbo_resolutions: usize,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    pub fn new(local_store: Arc<Mutex<LocalStore>>, remote_store: Arc<RemoteStore>) -> Self {
        Self::with_limbo_limit(
            local_store,
            remote_store,
            DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
        )
    }

    pub fn with_limbo_limit(
        local_store: Arc<Mutex<LocalStore>>,
        remote_store: Arc<RemoteStore>,
        max_concurrent_limbo_resolutions: usize,
    ) -> Self {
        Self {
            local_store,
            remote_store,
            max_concurrent_limbo_resolutions,
            state: Mutex::new(SyncEngineState {
                query_views: HashMap::new(),
                queries_by_target: HashMap::new(),
                listeners: HashMap::new(),
                limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: HashMap::new(),
                active_limbo_resolutions_by_target: HashMap::new(),
                limbo_document_refs: ReferenceSet::new(),
                mutation_callbacks: HashMap::new(),
                pending_writes_callbacks: HashMap::new(),
                online_state: OnlineState::Unknown,
            }),
        }
    }

    /// Starts listening to `query`, raising an initial snapshot from
    /// cached data and subscribing to the server-side target.
    pub async fn listen(
        &self,
        query: Query,
        listener: Arc<dyn SnapshotListener>,
    ) -> FirestoreResult<TargetId> {
        let key = query.canonical_id();
        let mut state = self.state.lock().await;

        if let Some(query_view) = state.query_views.get(&key) {
            let target_id = query_view.target_id;
            let snapshot = query_view.last_snapshot.clone();
            state.listeners.entry(key).or_default().push(Arc::clone(&listener));
            if let Some(snapshot) = snapshot {
                listener.on_snapshot(snapshot);
            }
            return Ok(target_id);
        }

        let target_data = self
            .local_store
            .lock()
            .await
            .allocate_target(query.to_target())?;
        let target_id = target_data.target_id;

        let query_result = self
            .local_store
            .lock()
            .await
            .execute_query(&query, true);
        let mut view = View::new(query.clone(), query_result.remote_keys.clone());
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);
        // The server has not confirmed anything yet; the initial snapshot
        // is always from cache.
        let synthesized =
            crate::remote::remote_event::TargetChange::synthesized_from_current_change(
                false,
                Bytes::new(),
            );
        let view_change = view.apply_changes(doc_changes, true, Some(&synthesized));
        hard_assert(
            view_change.limbo_changes.is_empty(),
            "non-current view produced limbo changes",
        );

        let snapshot = view_change.snapshot;
        state.query_views.insert(
            key.clone(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
                last_snapshot: snapshot.clone(),
            },
        );
        state
            .queries_by_target
            .entry(target_id)
            .or_default()
            .push(query);
        state.listeners.entry(key).or_default().push(Arc::clone(&listener));
        drop(state);

        if let Some(snapshot) = snapshot {
            listener.on_snapshot(snapshot);
        }
        self.remote_store.listen(target_data).await?;
        Ok(target_id)
    }

    /// Detaches `listener` from `query`; the last listener releases the
    /// target locally and remotely.
    pub async fn unlisten(
        &self,
        query: &Query,
        listener: &Arc<dyn SnapshotListener>,
    ) -> FirestoreResult<()> {
        let key = query.canonical_id();
        let mut state = self.state.lock().await;

        if let Some(listeners) = state.listeners.get_mut(&key) {
            listeners.retain(|registered| !Arc::ptr_eq(registered, listener));
            if !listeners.is_empty() {
                return Ok(());
            }
        }
        state.listeners.remove(&key);
        let Some(query_view) = state.query_views.remove(&key) else {
            return Ok(());
        };
        let target_id = query_view.target_id;

        let mut release_target = false;
        if let Some(queries) = state.queries_by_target.get_mut(&target_id) {
            queries.retain(|q| q.canonical_id() != key);
            if queries.is_empty() {
                state.queries_by_target.remove(&target_id);
                release_target = true;
            }
        }
        if !release_target {
            return Ok(());
        }

        let limbo_actions = self.release_limbo_references(&mut state, target_id);
        drop(state);

        self.local_store.lock().await.release_target(target_id)?;
        self.remote_store.unlisten(target_id).await?;
        self.run_limbo_actions(limbo_actions).await?;
        Ok(())
    }

    /// Applies `mutations` locally, raises snapshots reflecting the
    /// pending write, and queues the batch for the write stream.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<PendingWrite> {
        let result = self.local_store.lock().await.write_locally(mutations)?;
        let (sender, receiver) = oneshot::channel();

        let mut state = self.state.lock().await;
        state.mutation_callbacks.insert(result.batch_id, sender);
        self.emit_new_snaps_and_notify_local_store(&mut state, result.changes, None)
            .await?;
        drop(state);

        self.remote_store.fill_write_pipeline().await?;
        Ok(PendingWrite {
            batch_id: result.batch_id,
            receiver,
        })
    }

    /// Resolves once every write accepted so far has been acknowledged or
    /// rejected by the server.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let receiver = {
            let local_store = self.local_store.lock().await;
            if local_store.next_mutation_batch(-1).is_none() {
                return Ok(());
            }
            let highest = local_store.get_highest_unacknowledged_batch_id();
            drop(local_store);
            let (sender, receiver) = oneshot::channel();
            self.state
                .lock()
                .await
                .pending_writes_callbacks
                .entry(highest)
                .or_default()
                .push(sender);
            receiver
        };
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(internal_error("pending writes callback was dropped")),
        }
    }

    /// Rejects outstanding waiters and tears the network down.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock().await;
            let error = failed_precondition("client has shut down");
            for (_, sender) in state.mutation_callbacks.drain() {
                let _ = sender.send(Err(error.clone()));
            }
            for (_, senders) in state.pending_writes_callbacks.drain() {
                for sender in senders {
                    let _ = sender.send(Err(error.clone()));
                }
            }
        }
        self.remote_store.shutdown().await;
    }

    pub async fn online_state(&self) -> OnlineState {
        self.state.lock().await.online_state
    }

    async fn run_limbo_actions(&self, actions: Vec<LimboAction>) -> FirestoreResult<()> {
        for action in actions {
            match action {
                LimboAction::Listen(target_data) => {
                    self.remote_store.listen(target_data).await?;
                }
                LimboAction::Unlisten(target_id) => {
                    self.remote_store.unlisten(target_id).await?;
                }
            }
        }
        Ok(())
    }

    /// Re-diffs every view against `changes`, fans out the resulting
    /// snapshots, records limbo transitions, and reports the view deltas
    /// back to the local store for reference counting.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        state: &mut SyncEngineState,
        changes: MaybeDocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let mut snapshots: Vec<(String, ViewSnapshot)> = Vec::new();
        let mut limbo_changes: Vec<(TargetId, Vec<LimboDocumentChange>)> = Vec::new();
        let mut local_view_changes: Vec<LocalViewChanges> = Vec::new();

        let keys: Vec<String> = state.query_views.keys().cloned().collect();
        for key in keys {
            let Some(query_view) = state.query_views.get_mut(&key) else {
                continue;
            };
            let mut doc_changes = query_view.view.compute_doc_changes(&changes, None);
            if doc_changes.needs_refill {
                // The incremental diff crossed the limit boundary; re-run
                // the query against the full local cache.
                let query_result = self
                    .local_store
                    .lock()
                    .await
                    .execute_query(&query_view.query, false);
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&query_result.documents, Some(doc_changes));
            }
            let target_change =
                remote_event.and_then(|event| event.target_changes.get(&query_view.target_id));
            let view_change = query_view.view.apply_changes(doc_changes, true, target_change);
            limbo_changes.push((query_view.target_id, view_change.limbo_changes));
            if let Some(snapshot) = view_change.snapshot {
                query_view.last_snapshot = Some(snapshot.clone());
                local_view_changes.push(local_view_changes_from_snapshot(
                    query_view.target_id,
                    &snapshot,
                ));
                snapshots.push((key, snapshot));
            }
        }

        let mut limbo_actions = Vec::new();
        for (target_id, changes) in limbo_changes {
            limbo_actions.extend(self.update_tracked_limbos(state, changes, target_id));
        }

        for (key, snapshot) in snapshots {
            if let Some(listeners) = state.listeners.get(&key) {
                for listener in listeners {
                    listener.on_snapshot(snapshot.clone());
                }
            }
        }

        self.local_store
            .lock()
            .await
            .notify_local_view_changes(local_view_changes);
        self.run_limbo_actions(limbo_actions).await
    }

    fn update_tracked_limbos(
        &self,
        state: &mut SyncEngineState,
        changes: Vec<LimboDocumentChange>,
        target_id: TargetId,
    ) -> Vec<LimboAction> {
        let mut actions = Vec::new();
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    state.limbo_document_refs.add_reference(key.clone(), target_id);
                    if !state.active_limbo_targets_by_key.contains_key(&key)
                        && !state.enqueued_limbo_resolutions.contains(&key)
                    {
                        debug!("new document in limbo: {key}");
                        state.enqueued_limbo_resolutions.push_back(key);
                    }
                }
                LimboDocumentChange::Removed(key) => {
                    state.limbo_document_refs.remove_reference(&key, target_id);
                    if !state.limbo_document_refs.contains_key(&key) {
                        if let Some(action) = remove_limbo_target(state, &key) {
                            actions.push(action);
                        }
                    }
                }
            }
        }
        actions.extend(self.pump_enqueued_limbo_resolutions(state));
        actions
    }

    /// Starts point lookups for enqueued limbo documents, up to the
    /// concurrency cap.
    fn pump_enqueued_limbo_resolutions(&self, state: &mut SyncEngineState) -> Vec<LimboAction> {
        let mut actions = Vec::new();
        while state.active_limbo_resolutions_by_target.len() < self.max_concurrent_limbo_resolutions
        {
            let Some(key) = state.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = state.limbo_target_id_generator.next();
            state.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    document_received: false,
                },
            );
            state
                .active_limbo_targets_by_key
                .insert(key.clone(), limbo_target_id);
            actions.push(LimboAction::Listen(TargetData::new(
                crate::core::target::Target::for_document(key),
                limbo_target_id,
                TargetPurpose::LimboResolution,
                0,
            )));
        }
        actions
    }

    /// Drops limbo documents that were only kept alive by `target_id`.
    fn release_limbo_references(
        &self,
        state: &mut SyncEngineState,
        target_id: TargetId,
    ) -> Vec<LimboAction> {
        let keys = state.limbo_document_refs.remove_references_for_id(target_id);
        let mut actions = Vec::new();
        for key in keys.iter() {
            if !state.limbo_document_refs.contains_key(key) {
                if let Some(action) = remove_limbo_target(state, key) {
                    actions.push(action);
                }
            }
        }
        actions
    }

    /// Errors every listener of the target's queries and forgets the
    /// views.
    fn remove_and_cleanup_target(
        &self,
        state: &mut SyncEngineState,
        target_id: TargetId,
        error: &FirestoreError,
    ) -> Vec<LimboAction> {
        for query in state.queries_by_target.remove(&target_id).unwrap_or_default() {
            let key = query.canonical_id();
            state.query_views.remove(&key);
            for listener in state.listeners.remove(&key).unwrap_or_default() {
                listener.on_error(error.clone());
            }
        }
        self.release_limbo_references(state, target_id)
    }

    fn resolve_mutation_callback(
        &self,
        state: &mut SyncEngineState,
        batch_id: BatchId,
        result: FirestoreResult<()>,
    ) {
        if let Some(sender) = state.mutation_callbacks.remove(&batch_id) {
            let _ = sender.send(result);
        }
    }

    /// Batches acknowledge in order, so each waiter fires exactly when
    /// its own batch settles.
    fn trigger_pending_writes_callbacks(&self, state: &mut SyncEngineState, batch_id: BatchId) {
        for sender in state
            .pending_writes_callbacks
            .remove(&batch_id)
            .unwrap_or_default()
        {
            let _ = sender.send(Ok(()));
        }
    }

    #[cfg(test)]
    pub(crate) async fn active_limbo_resolution_count(&self) -> usize {
        self.state
            .lock()
            .await
            .active_limbo_resolutions_by_target
            .len()
    }

    #[cfg(test)]
    pub(crate) async fn enqueued_limbo_count(&self) -> usize {
        self.state.lock().await.enqueued_limbo_resolutions.len()
    }

    #[cfg(test)]
    pub(crate) async fn active_limbo_target_for(&self, key: &DocumentKey) -> Option<TargetId> {
        self.state
            .lock()
            .await
            .active_limbo_targets_by_key
            .get(key)
            .copied()
    }

    #[cfg(test)]
    pub(crate) async fn query_view_count(&self) -> usize {
        self.state.lock().await.query_views.len()
    }
}

fn remove_limbo_target(state: &mut SyncEngineState, key: &DocumentKey) -> Option<LimboAction> {
    state
        .enqueued_limbo_resolutions
        .retain(|enqueued| enqueued != key);
    let limbo_target_id = state.active_limbo_targets_by_key.remove(key)?;
    state
        .active_limbo_resolutions_by_target
        .remove(&limbo_target_id);
    Some(LimboAction::Unlisten(limbo_target_id))
}

fn local_view_changes_from_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut added = document_key_set();
    let mut removed = document_key_set();
    for change in &snapshot.doc_changes {
        match change.change_type {
            ChangeType::Added => added = added.insert(change.doc.key.clone()),
            ChangeType::Removed => removed = removed.insert(change.doc.key.clone()),
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        added_keys: added,
        removed_keys: removed,
    }
}

#[async_trait]
impl RemoteSyncer for SyncEngine {
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        let changes = self.local_store.lock().await.apply_remote_event(&event)?;

        let mut state = self.state.lock().await;
        for (target_id, target_change) in event.target_changes.iter() {
            if let Some(resolution) = state
                .active_limbo_resolutions_by_target
                .get_mut(target_id)
            {
                // Limbo targets are single-document; the watch stream can
                // report at most one membership change per snapshot.
                hard_assert(
                    target_change.added_documents.len()
                        + target_change.modified_documents.len()
                        + target_change.removed_documents.len()
                        <= 1,
                    "limbo resolution for single document contains multiple changes",
                );
                if !target_change.added_documents.is_empty() {
                    resolution.document_received = true;
                } else if !target_change.removed_documents.is_empty() {
                    hard_assert(
                        resolution.document_received,
                        "received a remove for a limbo document without an add",
                    );
                    resolution.document_received = false;
                }
            }
        }
        self.emit_new_snaps_and_notify_local_store(&mut state, changes, Some(&event))
            .await
    }

    async fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        let limbo_key = {
            let mut state = self.state.lock().await;
            match state.active_limbo_resolutions_by_target.remove(&target_id) {
                Some(resolution) => {
                    state.active_limbo_targets_by_key.remove(&resolution.key);
                    state.limbo_document_refs.remove_references_for_id(target_id);
                    Some(resolution.key)
                }
                None => None,
            }
        };

        match limbo_key {
            Some(key) => {
                // The server rejected the point lookup (e.g. permission
                // denied). Treat the document as deleted so dependent
                // views settle instead of hanging in limbo.
                let deleted = MaybeDocument::NoDocument(NoDocument {
                    key,
                    version: SnapshotVersion::min(),
                    has_committed_mutations: false,
                });
                let event = RemoteEvent::synthesized_document_event(target_id, deleted);
                self.apply_remote_event(event).await?;

                let mut state = self.state.lock().await;
                let actions = self.pump_enqueued_limbo_resolutions(&mut state);
                drop(state);
                self.run_limbo_actions(actions).await
            }
            None => {
                self.local_store.lock().await.release_target(target_id)?;
                let mut state = self.state.lock().await;
                let actions = self.remove_and_cleanup_target(&mut state, target_id, &error);
                drop(state);
                self.run_limbo_actions(actions).await
            }
        }
    }

    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.lock().await.acknowledge_batch(&result)?;

        let mut state = self.state.lock().await;
        // Resolve the writer before raising snapshots, so awaiting the
        // acknowledgement never observes a snapshot that precedes it.
        self.resolve_mutation_callback(&mut state, batch_id, Ok(()));
        self.trigger_pending_writes_callbacks(&mut state, batch_id);
        self.emit_new_snaps_and_notify_local_store(&mut state, changes, None)
            .await
    }

    async fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        let changes = self.local_store.lock().await.reject_batch(batch_id)?;

        let mut state = self.state.lock().await;
        self.resolve_mutation_callback(&mut state, batch_id, Err(error));
        // The batch is settled either way; waiters only care that nothing
        // is pending anymore.
        self.trigger_pending_writes_callbacks(&mut state, batch_id);
        self.emit_new_snaps_and_notify_local_store(&mut state, changes, None)
            .await
    }

    async fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        let state = self.state.lock().await;
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.document_received {
                return document_key_set().insert(resolution.key.clone());
            }
            return document_key_set();
        }
        let mut keys = document_key_set();
        if let Some(queries) = state.queries_by_target.get(&target_id) {
            for query in queries {
                if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
                    for key in query_view.view.synced_documents().iter() {
                        keys = keys.insert(key.clone());
                    }
                }
            }
        }
        keys
    }

    async fn handle_online_state_change(&self, online_state: OnlineState) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        state.online_state = online_state;
        let mut snapshots: Vec<(String, ViewSnapshot)> = Vec::new();
        for (key, query_view) in state.query_views.iter_mut() {
            let view_change = query_view.view.apply_online_state_change(online_state);
            hard_assert(
                view_change.limbo_changes.is_empty(),
                "online state change produced limbo changes",
            );
            if let Some(snapshot) = view_change.snapshot {
                query_view.last_snapshot = Some(snapshot.clone());
                snapshots.push((key.clone(), snapshot));
            }
        }
        for (key, snapshot) in snapshots {
            if let Some(listeners) = state.listeners.get(&key) {
                for listener in listeners {
                    listener.on_snapshot(snapshot.clone());
                }
            }
        }
        Ok(())
    }
}

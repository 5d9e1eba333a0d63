use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;

use crate::error::{internal_error, FirestoreError, FirestoreResult};
use crate::local::local_store::LocalStore;
use crate::local::target_data::{TargetData, TargetPurpose};
use crate::model::collections::{document_key_set, BatchId, DocumentKeySet, TargetId};
use crate::model::mutation::MutationResult;
use crate::model::mutation_batch::{MutationBatch, MutationBatchResult};
use crate::model::SnapshotVersion;
use crate::remote::connection::{Connection, ListenResponse};
use crate::remote::datastore::CredentialsProvider;
use crate::remote::online_state_tracker::{OnlineState, OnlineStateTracker};
use crate::remote::remote_syncer::RemoteSyncer;
use crate::remote::rpc_error::is_permanent_write_error;
use crate::remote::streams::{WatchStream, WatchStreamDelegate, WriteStream, WriteStreamDelegate};
use crate::remote::watch_change::{WatchChange, WatchTargetChange, WatchTargetChangeState};
use crate::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::util::assert::hard_assert;
use crate::util::async_queue::AsyncQueue;

/// Upper bound on mutation batches in flight on the write stream.
/// Batches beyond this stay queued locally until earlier ones are acked.
pub const MAX_PENDING_WRITES: usize = 10;

const BATCH_ID_UNKNOWN: BatchId = -1;

/// Reasons the network is held offline. The streams may run only while
/// this set is empty.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
enum OfflineCause {
    UserDisabled,
    Shutdown,
    CredentialChange,
}

/// Owns the watch and write streams and mediates between them, the local
/// store and the sync layer.
///
/// All entry points run on the engine queue; the struct is not otherwise
/// thread-safe in its sequencing assumptions.
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

struct RemoteStoreInner {
    weak_self: Weak<RemoteStoreInner>,
    local_store: Arc<Mutex<LocalStore>>,
    watch_stream: Arc<WatchStream>,
    write_stream: Arc<WriteStream>,
    online_state_tracker: Arc<OnlineStateTracker>,
    syncer: Mutex<Option<Arc<dyn RemoteSyncer>>>,
    /// Targets with an active server-side listen (or one being started).
    listen_targets: Mutex<HashMap<TargetId, TargetData>>,
    /// Batches sent (or about to be sent) on the write stream, in order.
    write_pipeline: Mutex<VecDeque<MutationBatch>>,
    offline_causes: Mutex<HashSet<OfflineCause>>,
    aggregator: Mutex<Option<WatchChangeAggregator>>,
}

/// Adapter giving the aggregator access to engine state without a strong
/// reference cycle back into the store.
struct MetadataAdapter {
    store: Weak<RemoteStoreInner>,
}

#[async_trait]
impl TargetMetadataProvider for MetadataAdapter {
    async fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        let Some(store) = self.store.upgrade() else {
            return document_key_set();
        };
        let syncer = store.syncer.lock().await.clone();
        match syncer {
            Some(syncer) => syncer.get_remote_keys_for_target(target_id).await,
            None => document_key_set(),
        }
    }

    async fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        let store = self.store.upgrade()?;
        let targets = store.listen_targets.lock().await;
        targets.get(&target_id).cloned()
    }
}

impl RemoteStore {
    /// The network starts disabled; call `enable_network` once the syncer
    /// is wired up.
    pub fn new(
        local_store: Arc<Mutex<LocalStore>>,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        queue: AsyncQueue,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| RemoteStoreInner {
            weak_self: weak.clone(),
            local_store,
            watch_stream: Arc::new(WatchStream::new(
                queue.clone(),
                Arc::clone(&connection),
                Arc::clone(&credentials),
            )),
            write_stream: Arc::new(WriteStream::new(queue.clone(), connection, credentials)),
            online_state_tracker: Arc::new(OnlineStateTracker::new(queue)),
            syncer: Mutex::new(None),
            listen_targets: Mutex::new(HashMap::new()),
            write_pipeline: Mutex::new(VecDeque::new()),
            offline_causes: Mutex::new(HashSet::from([OfflineCause::UserDisabled])),
            aggregator: Mutex::new(None),
        });
        Self { inner }
    }

    /// Injects the sync layer. Must happen before the network is enabled.
    pub async fn set_syncer(&self, syncer: Arc<dyn RemoteSyncer>) {
        *self.inner.syncer.lock().await = Some(Arc::clone(&syncer));
        let handler_syncer = syncer;
        self.inner
            .online_state_tracker
            .set_handler(Arc::new(move |state| {
                let syncer = Arc::clone(&handler_syncer);
                Box::pin(async move { syncer.handle_online_state_change(state).await })
            }))
            .await;
    }

    pub async fn can_use_network(&self) -> bool {
        self.inner.can_use_network().await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner
            .offline_causes
            .lock()
            .await
            .remove(&OfflineCause::UserDisabled);
        self.inner.enable_network_internal().await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner
            .offline_causes
            .lock()
            .await
            .insert(OfflineCause::UserDisabled);
        self.inner.disable_network_internal().await;
        // Stays Offline (rather than Unknown) until the network is
        // re-enabled, so views report from-cache immediately.
        self.inner.online_state_tracker.set(OnlineState::Offline).await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        debug!("remote store shutting down");
        self.inner
            .offline_causes
            .lock()
            .await
            .insert(OfflineCause::Shutdown);
        self.inner.disable_network_internal().await;
        self.inner.online_state_tracker.set(OnlineState::Offline).await;
    }

    /// Tears the streams down and brings them back up with fresh
    /// credentials.
    pub async fn handle_credential_change(&self) -> FirestoreResult<()> {
        self.inner
            .offline_causes
            .lock()
            .await
            .insert(OfflineCause::CredentialChange);
        self.inner.disable_network_internal().await;
        self.inner.online_state_tracker.set(OnlineState::Unknown).await;
        self.inner
            .offline_causes
            .lock()
            .await
            .remove(&OfflineCause::CredentialChange);
        self.inner.enable_network_internal().await
    }

    /// Starts a server-side listen for `target_data`.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        {
            let mut targets = self.inner.listen_targets.lock().await;
            if targets.contains_key(&target_id) {
                return Ok(());
            }
            targets.insert(target_id, target_data.clone());
        }
        if self.inner.should_start_watch_stream().await {
            self.inner.start_watch_stream().await;
        } else if self.inner.watch_stream.is_open().await {
            self.inner.send_watch_request(&target_data).await?;
        }
        Ok(())
    }

    /// Stops the server-side listen for `target_id`.
    pub async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        let remaining = {
            let mut targets = self.inner.listen_targets.lock().await;
            hard_assert(
                targets.remove(&target_id).is_some(),
                "unlistening to an unknown target",
            );
            !targets.is_empty()
        };
        if self.inner.watch_stream.is_open().await {
            self.inner.send_unwatch_request(target_id).await?;
        }
        if !remaining {
            if self.inner.watch_stream.is_open().await {
                self.inner.watch_stream.mark_idle().await;
            } else if self.inner.can_use_network().await {
                // No active targets and no stream: there is nothing to
                // infer connectivity from.
                self.inner.online_state_tracker.set(OnlineState::Unknown).await;
            }
        }
        Ok(())
    }

    /// Pulls pending batches from the local store into the write pipeline
    /// and sends them, up to [`MAX_PENDING_WRITES`] in flight.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    pub async fn outstanding_writes(&self) -> usize {
        self.inner.write_pipeline.lock().await.len()
    }
}

impl RemoteStoreInner {
    fn strong(&self) -> FirestoreResult<Arc<RemoteStoreInner>> {
        self.weak_self
            .upgrade()
            .ok_or_else(|| internal_error("remote store was dropped"))
    }

    async fn syncer(&self) -> FirestoreResult<Arc<dyn RemoteSyncer>> {
        self.syncer
            .lock()
            .await
            .clone()
            .ok_or_else(|| internal_error("remote store used before its syncer was set"))
    }

    async fn can_use_network(&self) -> bool {
        self.offline_causes.lock().await.is_empty()
    }

    async fn enable_network_internal(&self) -> FirestoreResult<()> {
        if !self.can_use_network().await {
            return Ok(());
        }
        let token = self.local_store.lock().await.get_last_stream_token();
        self.write_stream.set_last_stream_token(token).await;

        if self.should_start_watch_stream().await {
            self.start_watch_stream().await;
        } else {
            self.online_state_tracker.set(OnlineState::Unknown).await;
        }
        self.fill_write_pipeline().await
    }

    async fn disable_network_internal(&self) {
        self.write_stream.stop().await;
        self.watch_stream.stop().await;

        let mut pipeline = self.write_pipeline.lock().await;
        if !pipeline.is_empty() {
            debug!(
                "stopping write stream with {} pending writes",
                pipeline.len()
            );
            // The batches stay in the local store; the pipeline refills
            // from it when the network comes back.
            pipeline.clear();
        }
        drop(pipeline);
        self.clean_up_watch_stream_state().await;
    }

    async fn clean_up_watch_stream_state(&self) {
        *self.aggregator.lock().await = None;
    }

    async fn should_start_watch_stream(&self) -> bool {
        self.can_use_network().await
            && !self.watch_stream.is_started().await
            && !self.listen_targets.lock().await.is_empty()
    }

    async fn start_watch_stream(&self) {
        let Ok(this) = self.strong() else { return };
        *self.aggregator.lock().await = Some(WatchChangeAggregator::new(Arc::new(
            MetadataAdapter {
                store: self.weak_self.clone(),
            },
        )));
        let delegate: Arc<dyn WatchStreamDelegate> = Arc::clone(&this) as _;
        self.watch_stream.start(delegate).await;
        self.online_state_tracker.handle_watch_stream_start().await;
    }

    async fn send_watch_request(&self, target_data: &TargetData) -> FirestoreResult<()> {
        if let Some(aggregator) = self.aggregator.lock().await.as_mut() {
            aggregator.record_pending_target_request(target_data.target_id);
        }
        self.watch_stream.watch(target_data).await
    }

    async fn send_unwatch_request(&self, target_id: TargetId) -> FirestoreResult<()> {
        if let Some(aggregator) = self.aggregator.lock().await.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.unwatch(target_id).await
    }

    /// Materializes the aggregated changes at `snapshot_version`, updates
    /// resume tokens, re-listens to any mismatched targets, and hands the
    /// event to the sync layer.
    async fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        hard_assert(
            snapshot_version != SnapshotVersion::min(),
            "raising a watch snapshot with no version",
        );
        let event = {
            let mut aggregator = self.aggregator.lock().await;
            match aggregator.as_mut() {
                Some(aggregator) => aggregator.create_remote_event(snapshot_version).await,
                None => return Ok(()),
            }
        };

        {
            let mut targets = self.listen_targets.lock().await;
            for (target_id, change) in event.target_changes.iter() {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = targets.get(target_id).cloned() {
                    targets.insert(
                        *target_id,
                        target_data
                            .with_resume_token(change.resume_token.clone(), snapshot_version),
                    );
                }
            }
        }

        // A mismatched target's local contents cannot be trusted; drop the
        // resume token and listen again from scratch.
        let mut relisten = Vec::new();
        {
            let mut targets = self.listen_targets.lock().await;
            for target_id in event.target_mismatches.iter() {
                if let Some(target_data) = targets.get(target_id).cloned() {
                    let request = TargetData::new(
                        target_data.target,
                        *target_id,
                        TargetPurpose::ExistenceFilterMismatch,
                        target_data.sequence_number,
                    );
                    targets.insert(*target_id, request.clone());
                    relisten.push(request);
                }
            }
        }
        for request in relisten {
            self.send_unwatch_request(request.target_id).await?;
            self.send_watch_request(&request).await?;
        }

        self.syncer().await?.apply_remote_event(event).await
    }

    /// The server rejected one or more targets; drop them locally and let
    /// the sync layer surface the error.
    async fn handle_target_error(&self, change: &WatchTargetChange) -> FirestoreResult<()> {
        let error = match &change.cause {
            Some(cause) => cause.clone(),
            None => internal_error("watch target removal without a cause"),
        };
        for target_id in &change.target_ids {
            let known = self.listen_targets.lock().await.remove(target_id).is_some();
            if known {
                if let Some(aggregator) = self.aggregator.lock().await.as_mut() {
                    aggregator.remove_target(*target_id);
                }
                self.syncer()
                    .await?
                    .reject_listen(*target_id, error.clone())
                    .await?;
            }
        }
        Ok(())
    }

    async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let mut last_batch_id = self
            .write_pipeline
            .lock()
            .await
            .back()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN);

        while self.can_add_to_write_pipeline().await {
            let next = self.local_store.lock().await.next_mutation_batch(last_batch_id);
            match next {
                None => {
                    if self.write_pipeline.lock().await.is_empty() {
                        self.write_stream.mark_idle().await;
                    }
                    break;
                }
                Some(batch) => {
                    last_batch_id = batch.batch_id;
                    self.add_to_write_pipeline(batch).await?;
                }
            }
        }

        if self.should_start_write_stream().await {
            self.start_write_stream().await;
        }
        Ok(())
    }

    async fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network().await
            && self.write_pipeline.lock().await.len() < MAX_PENDING_WRITES
    }

    async fn add_to_write_pipeline(&self, batch: MutationBatch) -> FirestoreResult<()> {
        let mutations = batch.mutations.clone();
        self.write_pipeline.lock().await.push_back(batch);
        if self.write_stream.is_open().await && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(mutations).await?;
        }
        Ok(())
    }

    async fn should_start_write_stream(&self) -> bool {
        self.can_use_network().await
            && !self.write_stream.is_started().await
            && !self.write_pipeline.lock().await.is_empty()
    }

    async fn start_write_stream(&self) {
        let Ok(this) = self.strong() else { return };
        let delegate: Arc<dyn WriteStreamDelegate> = Arc::clone(&this) as _;
        self.write_stream.start(delegate).await;
    }

    /// Permanent handshake errors mean our stream token is garbage; clear
    /// it so the next connection starts a fresh stream.
    async fn handle_handshake_error(&self, error: &FirestoreError) -> FirestoreResult<()> {
        if is_permanent_write_error(error.code) {
            debug!("discarding invalid stream token after handshake error: {error}");
            self.write_stream.set_last_stream_token(Bytes::new()).await;
            self.local_store.lock().await.set_last_stream_token(Bytes::new());
        }
        Ok(())
    }

    /// A permanent write error rejects the head of the pipeline; transient
    /// ones leave it in place for the reconnect to resend.
    async fn handle_write_error(&self, error: &FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            return Ok(());
        }
        let batch = self.write_pipeline.lock().await.pop_front();
        let Some(batch) = batch else { return Ok(()) };
        // The stream is healthy enough to report errors; reconnect without
        // backoff so remaining writes go out promptly.
        self.write_stream.inhibit_backoff().await;
        self.syncer()
            .await?
            .reject_failed_write(batch.batch_id, error.clone())
            .await?;
        self.fill_write_pipeline().await
    }
}

#[async_trait]
impl WatchStreamDelegate for RemoteStoreInner {
    async fn on_watch_stream_open(&self) -> FirestoreResult<()> {
        let targets: Vec<TargetData> =
            self.listen_targets.lock().await.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(&target_data).await?;
        }
        Ok(())
    }

    async fn on_watch_stream_change(&self, response: ListenResponse) -> FirestoreResult<()> {
        // Any server message proves connectivity.
        self.online_state_tracker.set(OnlineState::Online).await;

        if let WatchChange::TargetChange(target_change) = &response.change {
            if target_change.state == WatchTargetChangeState::Removed
                && target_change.cause.is_some()
            {
                return self.handle_target_error(target_change).await;
            }
        }

        {
            let mut aggregator = self.aggregator.lock().await;
            let Some(aggregator) = aggregator.as_mut() else {
                return Ok(());
            };
            match response.change {
                WatchChange::Document(change) => aggregator.handle_document_change(change).await,
                WatchChange::TargetChange(change) => {
                    aggregator.handle_target_change(change).await
                }
                WatchChange::ExistenceFilter(change) => {
                    aggregator.handle_existence_filter(change).await
                }
            }
        }

        if response.snapshot_version != SnapshotVersion::min() {
            let last_version = self
                .local_store
                .lock()
                .await
                .get_last_remote_snapshot_version();
            if response.snapshot_version >= last_version {
                self.raise_watch_snapshot(response.snapshot_version).await?;
            }
        }
        Ok(())
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.clean_up_watch_stream_state().await;
        if self.should_start_watch_stream().await {
            if let Some(err) = &error {
                self.online_state_tracker.handle_watch_stream_failure(err).await;
            }
            self.start_watch_stream().await;
        } else {
            self.online_state_tracker.set(OnlineState::Unknown).await;
        }
        Ok(())
    }
}

#[async_trait]
impl WriteStreamDelegate for RemoteStoreInner {
    async fn on_write_stream_open(&self) -> FirestoreResult<()> {
        self.write_stream.write_handshake().await
    }

    async fn on_write_handshake_complete(&self) -> FirestoreResult<()> {
        // Resend everything that was in flight when the stream dropped.
        let batches: Vec<MutationBatch> =
            self.write_pipeline.lock().await.iter().cloned().collect();
        for batch in batches {
            self.write_stream.write_mutations(batch.mutations.clone()).await?;
        }
        Ok(())
    }

    async fn on_write_response(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        let batch = self.write_pipeline.lock().await.pop_front();
        let Some(batch) = batch else {
            return Err(internal_error("write acknowledgement without a pending batch"));
        };
        let stream_token = self.write_stream.last_stream_token().await;
        let success = MutationBatchResult::from(batch, commit_version, results, stream_token);
        self.syncer().await?.apply_successful_write(success).await?;
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        if let Some(err) = &error {
            if !self.write_pipeline.lock().await.is_empty() {
                if self.write_stream.handshake_complete() {
                    self.handle_write_error(err).await?;
                } else {
                    self.handle_handshake_error(err).await?;
                }
                if self.should_start_write_stream().await {
                    self.start_write_stream().await;
                }
            }
        }
        Ok(())
    }
}

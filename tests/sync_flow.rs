//! End-to-end flows over scripted transport streams: the sync engine,
//! local store and remote store wired together the way a client would
//! use them, with the server side played by the test.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_lock::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use firestore_sync::core::{ChangeType, Query, SnapshotListener, SyncEngine, ViewSnapshot};
use firestore_sync::error::{FirestoreError, FirestoreResult};
use firestore_sync::local::local_store::LocalStore;
use firestore_sync::model::collections::TargetId;
use firestore_sync::model::document::{Document, DocumentState, MaybeDocument};
use firestore_sync::model::mutation::{Mutation, MutationResult, Precondition};
use firestore_sync::model::object_value::ObjectValue;
use firestore_sync::model::resource_path::ResourcePath;
use firestore_sync::model::{DocumentKey, SnapshotVersion};
use firestore_sync::remote::connection::{
    Connection, ListenRequest, ListenResponse, ListenStreamHandle, StreamEvent, StreamHandle,
    WriteRequest, WriteResponse, WriteStreamHandle,
};
use firestore_sync::remote::datastore::EmptyCredentialsProvider;
use firestore_sync::remote::remote_store::RemoteStore;
use firestore_sync::remote::remote_syncer::RemoteSyncer;
use firestore_sync::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchChange, WatchTargetChange,
    WatchTargetChangeState,
};
use firestore_sync::util::async_queue::AsyncQueue;

/// A stream whose outbound requests are recorded and whose inbound events
/// are fed by the test through a channel.
struct ScriptedStream<Req, Resp> {
    requests: StdMutex<Vec<Req>>,
    events: async_channel::Receiver<StreamEvent<Resp>>,
}

#[async_trait]
impl<Req: Send + Sync, Resp: Send + Sync> StreamHandle<Req, Resp> for ScriptedStream<Req, Resp> {
    async fn send(&self, message: Req) -> FirestoreResult<()> {
        self.requests.lock().unwrap().push(message);
        Ok(())
    }

    async fn next_event(&self) -> StreamEvent<Resp> {
        match self.events.recv().await {
            Ok(event) => event,
            Err(_) => StreamEvent::Close(None),
        }
    }

    async fn close(&self) {
        self.events.close();
    }
}

#[derive(Clone)]
struct ScriptedListen {
    handle: Arc<ScriptedStream<ListenRequest, ListenResponse>>,
    events: async_channel::Sender<StreamEvent<ListenResponse>>,
}

#[derive(Clone)]
struct ScriptedWrite {
    handle: Arc<ScriptedStream<WriteRequest, WriteResponse>>,
    events: async_channel::Sender<StreamEvent<WriteResponse>>,
}

#[derive(Default)]
struct ScriptedConnection {
    listen_streams: StdMutex<Vec<ScriptedListen>>,
    write_streams: StdMutex<Vec<ScriptedWrite>>,
}

impl ScriptedConnection {
    fn latest_listen(&self) -> ScriptedListen {
        self.listen_streams.lock().unwrap().last().cloned().unwrap()
    }

    fn latest_write(&self) -> ScriptedWrite {
        self.write_streams.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn open_listen_stream(
        &self,
        _token: Option<String>,
    ) -> FirestoreResult<ListenStreamHandle> {
        let (sender, receiver) = async_channel::unbounded();
        let handle = Arc::new(ScriptedStream {
            requests: StdMutex::new(Vec::new()),
            events: receiver,
        });
        self.listen_streams.lock().unwrap().push(ScriptedListen {
            handle: Arc::clone(&handle),
            events: sender,
        });
        let dyn_handle: ListenStreamHandle = handle;
        Ok(dyn_handle)
    }

    async fn open_write_stream(
        &self,
        _token: Option<String>,
    ) -> FirestoreResult<WriteStreamHandle> {
        let (sender, receiver) = async_channel::unbounded();
        let handle = Arc::new(ScriptedStream {
            requests: StdMutex::new(Vec::new()),
            events: receiver,
        });
        self.write_streams.lock().unwrap().push(ScriptedWrite {
            handle: Arc::clone(&handle),
            events: sender,
        });
        let dyn_handle: WriteStreamHandle = handle;
        Ok(dyn_handle)
    }
}

#[derive(Default)]
struct RecordingListener {
    snapshots: StdMutex<Vec<ViewSnapshot>>,
    errors: StdMutex<Vec<FirestoreError>>,
}

impl RecordingListener {
    fn last_snapshot(&self) -> ViewSnapshot {
        self.snapshots.lock().unwrap().last().cloned().unwrap()
    }
}

impl SnapshotListener for RecordingListener {
    fn on_snapshot(&self, snapshot: ViewSnapshot) {
        self.snapshots.lock().unwrap().push(snapshot);
    }

    fn on_error(&self, error: FirestoreError) {
        self.errors.lock().unwrap().push(error);
    }
}

struct Harness {
    queue: AsyncQueue,
    engine: Arc<SyncEngine>,
    local_store: Arc<Mutex<LocalStore>>,
    remote_store: Arc<RemoteStore>,
    connection: Arc<ScriptedConnection>,
}

async fn harness() -> Harness {
    let queue = AsyncQueue::new();
    let connection = Arc::new(ScriptedConnection::default());
    let local_store = Arc::new(Mutex::new(LocalStore::new()));
    let remote_store = Arc::new(RemoteStore::new(
        Arc::clone(&local_store),
        Arc::clone(&connection) as Arc<dyn Connection>,
        Arc::new(EmptyCredentialsProvider::default()),
        queue.clone(),
    ));
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&local_store),
        Arc::clone(&remote_store),
    ));
    remote_store
        .set_syncer(Arc::clone(&engine) as Arc<dyn RemoteSyncer>)
        .await;
    Harness {
        queue,
        engine,
        local_store,
        remote_store,
        connection,
    }
}

/// Lets the stream pump tasks and everything they enqueue run to
/// completion.
async fn settle(queue: &AsyncQueue) {
    for _ in 0..4 {
        queue.drain().await;
    }
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_path_string(path).unwrap()
}

fn docs_query() -> Query {
    Query::at_path(ResourcePath::from_string("docs").unwrap())
}

fn set_mutation(path: &str, data: serde_json::Value) -> Mutation {
    Mutation::Set {
        key: key(path),
        value: ObjectValue::from_value(data),
        precondition: Precondition::None,
    }
}

fn synced_doc(path: &str, version: i64, data: serde_json::Value) -> MaybeDocument {
    MaybeDocument::Document(Document {
        key: key(path),
        version: SnapshotVersion::new(version, 0),
        data: ObjectValue::from_value(data),
        state: DocumentState::Synced,
    })
}

fn watch_message(change: WatchChange) -> StreamEvent<ListenResponse> {
    StreamEvent::Message(ListenResponse {
        change,
        snapshot_version: SnapshotVersion::min(),
    })
}

/// A global no-change message carrying the snapshot version, which tells
/// the client the server has caught up and a consistent snapshot can be
/// raised.
fn global_snapshot(version: i64, token: &'static [u8]) -> StreamEvent<ListenResponse> {
    StreamEvent::Message(ListenResponse {
        change: WatchChange::TargetChange(
            WatchTargetChange::new(WatchTargetChangeState::NoChange, Vec::new())
                .with_resume_token(Bytes::from_static(token)),
        ),
        snapshot_version: SnapshotVersion::new(version, 0),
    })
}

async fn bring_target_current(
    stream: &ScriptedListen,
    target_id: TargetId,
    doc: MaybeDocument,
    version: i64,
) {
    let doc_key = doc.key().clone();
    stream
        .events
        .send(watch_message(WatchChange::TargetChange(
            WatchTargetChange::new(WatchTargetChangeState::Added, vec![target_id]),
        )))
        .await
        .unwrap();
    stream
        .events
        .send(watch_message(WatchChange::Document(DocumentWatchChange {
            updated_target_ids: vec![target_id],
            removed_target_ids: Vec::new(),
            key: doc_key,
            new_doc: Some(doc),
        })))
        .await
        .unwrap();
    stream
        .events
        .send(watch_message(WatchChange::TargetChange(
            WatchTargetChange::new(WatchTargetChangeState::Current, vec![target_id])
                .with_resume_token(Bytes::from_static(b"rt-1")),
        )))
        .await
        .unwrap();
    stream
        .events
        .send(global_snapshot(version, b"rt-1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn watch_stream_confirms_a_listened_query() {
    let h = harness().await;
    h.remote_store.enable_network().await.unwrap();

    let listener = Arc::new(RecordingListener::default());
    let target_id = h
        .engine
        .listen(docs_query(), Arc::clone(&listener) as _)
        .await
        .unwrap();
    settle(&h.queue).await;

    let stream = h.connection.latest_listen();
    stream.events.send(StreamEvent::Open).await.unwrap();
    settle(&h.queue).await;

    // The open stream immediately registers the allocated target, with no
    // resume token on a fresh listen.
    {
        let requests = stream.handle.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        match &requests[0] {
            ListenRequest::AddTarget(req) => {
                assert_eq!(req.target_id, target_id);
                assert!(req.resume_token.is_empty());
            }
            other => panic!("expected AddTarget, got {other:?}"),
        }
    }

    bring_target_current(
        &stream,
        target_id,
        synced_doc("docs/a", 1, json!({"v": 1})),
        1,
    )
    .await;
    settle(&h.queue).await;

    let snapshot = listener.last_snapshot();
    assert!(!snapshot.from_cache);
    assert_eq!(snapshot.docs.len(), 1);
    assert!(snapshot
        .doc_changes
        .iter()
        .any(|c| c.change_type == ChangeType::Added && c.doc.key == key("docs/a")));
    assert_eq!(
        h.local_store.lock().await.get_last_remote_snapshot_version(),
        SnapshotVersion::new(1, 0)
    );
}

#[tokio::test]
async fn write_pipeline_handshakes_then_sends_and_acknowledges_batches() {
    let h = harness().await;

    // Written while offline; queued locally.
    let pending = h
        .engine
        .write(vec![set_mutation("docs/a", json!({"v": 1}))])
        .await
        .unwrap();

    h.remote_store.enable_network().await.unwrap();
    settle(&h.queue).await;

    let stream = h.connection.latest_write();
    stream.events.send(StreamEvent::Open).await.unwrap();
    settle(&h.queue).await;

    {
        let requests = stream.handle.requests.lock().unwrap();
        assert!(matches!(requests.as_slice(), [WriteRequest::Handshake]));
    }

    // Handshake response: token only, no results.
    stream
        .events
        .send(StreamEvent::Message(WriteResponse {
            stream_token: Bytes::from_static(b"wt-1"),
            commit_version: SnapshotVersion::min(),
            write_results: Vec::new(),
        }))
        .await
        .unwrap();
    settle(&h.queue).await;

    // The queued batch goes out carrying the handshake token.
    {
        let requests = stream.handle.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        match &requests[1] {
            WriteRequest::Writes {
                stream_token,
                mutations,
            } => {
                assert_eq!(stream_token, &Bytes::from_static(b"wt-1"));
                assert_eq!(mutations.len(), 1);
            }
            other => panic!("expected Writes, got {other:?}"),
        }
    }

    stream
        .events
        .send(StreamEvent::Message(WriteResponse {
            stream_token: Bytes::from_static(b"wt-2"),
            commit_version: SnapshotVersion::new(7, 0),
            write_results: vec![MutationResult {
                version: SnapshotVersion::new(7, 0),
                transform_results: None,
            }],
        }))
        .await
        .unwrap();
    settle(&h.queue).await;

    pending.acknowledged().await.unwrap();
    assert_eq!(h.remote_store.outstanding_writes().await, 0);
    assert_eq!(
        h.local_store.lock().await.get_last_stream_token(),
        Bytes::from_static(b"wt-2")
    );
}

#[tokio::test]
async fn existence_filter_mismatch_relistens_without_resume_token() {
    let h = harness().await;
    h.remote_store.enable_network().await.unwrap();

    let listener = Arc::new(RecordingListener::default());
    let target_id = h
        .engine
        .listen(docs_query(), Arc::clone(&listener) as _)
        .await
        .unwrap();
    settle(&h.queue).await;

    let stream = h.connection.latest_listen();
    stream.events.send(StreamEvent::Open).await.unwrap();
    settle(&h.queue).await;

    bring_target_current(
        &stream,
        target_id,
        synced_doc("docs/a", 1, json!({"v": 1})),
        1,
    )
    .await;
    settle(&h.queue).await;
    assert!(!listener.last_snapshot().from_cache);

    // The server claims two documents; the client holds one, so a delete
    // was missed and the target cannot be trusted.
    stream
        .events
        .send(watch_message(WatchChange::ExistenceFilter(
            ExistenceFilterChange {
                target_id,
                count: 2,
            },
        )))
        .await
        .unwrap();
    stream
        .events
        .send(global_snapshot(2, b""))
        .await
        .unwrap();
    settle(&h.queue).await;

    let requests = stream.handle.requests.lock().unwrap();
    assert_eq!(requests.len(), 3);
    assert!(matches!(&requests[1], ListenRequest::RemoveTarget(id) if *id == target_id));
    match &requests[2] {
        ListenRequest::AddTarget(req) => {
            assert_eq!(req.target_id, target_id);
            // The re-listen starts from scratch.
            assert!(req.resume_token.is_empty());
        }
        other => panic!("expected AddTarget, got {other:?}"),
    }
    drop(requests);

    // Until the fresh listen catches up the results are cache-only again.
    assert!(listener.last_snapshot().from_cache);
}

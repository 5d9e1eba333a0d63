use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::core::target::Target;
use crate::error::{FirestoreError, FirestoreResult};
use crate::model::collections::TargetId;
use crate::model::mutation::{Mutation, MutationResult};
use crate::model::SnapshotVersion;
use crate::remote::watch_change::WatchChange;

/// Request to start watching one target, with the resume token to pick up
/// from (empty for a fresh listen).
#[derive(Clone, Debug)]
pub struct WatchTargetRequest {
    pub target: Target,
    pub target_id: TargetId,
    pub resume_token: Bytes,
}

/// Messages sent on the listen stream.
#[derive(Clone, Debug)]
pub enum ListenRequest {
    AddTarget(WatchTargetRequest),
    RemoveTarget(TargetId),
}

/// One message received on the listen stream: a watch change plus the
/// snapshot version the server has reached.
#[derive(Clone, Debug)]
pub struct ListenResponse {
    pub change: WatchChange,
    pub snapshot_version: SnapshotVersion,
}

/// Messages sent on the write stream. The first message must be a
/// handshake; every subsequent write carries the last stream token the
/// server issued.
#[derive(Clone, Debug)]
pub enum WriteRequest {
    Handshake,
    Writes {
        stream_token: Bytes,
        mutations: Vec<Mutation>,
    },
}

/// One message received on the write stream. The handshake response
/// carries only a stream token; acknowledgements also carry the commit
/// version and per-mutation results.
#[derive(Clone, Debug)]
pub struct WriteResponse {
    pub stream_token: Bytes,
    pub commit_version: SnapshotVersion,
    pub write_results: Vec<MutationResult>,
}

/// Lifecycle events surfaced by a transport stream.
#[derive(Clone, Debug)]
pub enum StreamEvent<Resp> {
    Open,
    Message(Resp),
    /// Terminal; carries the error that closed the stream, if any.
    Close(Option<FirestoreError>),
}

/// A live bidirectional stream. `next` yields `Open` first, then
/// messages, then exactly one `Close`.
#[async_trait]
pub trait StreamHandle<Req, Resp>: Send + Sync {
    async fn send(&self, message: Req) -> FirestoreResult<()>;
    async fn next_event(&self) -> StreamEvent<Resp>;
    async fn close(&self);
}

pub type ListenStreamHandle = Arc<dyn StreamHandle<ListenRequest, ListenResponse>>;
pub type WriteStreamHandle = Arc<dyn StreamHandle<WriteRequest, WriteResponse>>;

/// The transport boundary: everything the engine needs from the network.
/// Implementations wrap a real RPC channel; tests substitute scripted
/// streams.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_listen_stream(&self, token: Option<String>)
        -> FirestoreResult<ListenStreamHandle>;
    async fn open_write_stream(&self, token: Option<String>)
        -> FirestoreResult<WriteStreamHandle>;
}

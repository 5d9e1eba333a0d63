use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{FirestoreError, FirestoreResult};
use crate::model::mutation::{Mutation, MutationResult};
use crate::model::SnapshotVersion;
use crate::remote::connection::{Connection, WriteRequest, WriteResponse};
use crate::remote::datastore::CredentialsProvider;
use crate::remote::persistent_stream::{OpenStreamFn, PersistentStream, StreamListener};
use crate::util::assert::hard_assert;
use crate::util::async_queue::{AsyncQueue, TimerId};

/// Receives write stream events, on the engine queue.
#[async_trait]
pub trait WriteStreamDelegate: Send + Sync {
    async fn on_write_stream_open(&self) -> FirestoreResult<()>;
    async fn on_write_handshake_complete(&self) -> FirestoreResult<()>;
    async fn on_write_response(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()>;
    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

/// The write stream: a handshake followed by mutation batches, each
/// acknowledged in order. The stream token from the latest response is
/// attached to the next request so the server can resume the stream's
/// write ordering across reconnects.
pub struct WriteStream {
    inner: Arc<PersistentStream<WriteRequest, WriteResponse>>,
    delegate: Mutex<Option<Arc<dyn WriteStreamDelegate>>>,
    handshake_complete: AtomicBool,
    last_stream_token: Mutex<Bytes>,
}

impl WriteStream {
    pub fn new(
        queue: AsyncQueue,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Self {
        let open_stream: OpenStreamFn<WriteRequest, WriteResponse> = Arc::new(move |token| {
            let connection = Arc::clone(&connection);
            Box::pin(async move { connection.open_write_stream(token).await })
        });
        Self {
            inner: Arc::new(PersistentStream::new(
                queue,
                TimerId::WriteStreamConnectionBackoff,
                TimerId::WriteStreamIdle,
                credentials,
                open_stream,
            )),
            delegate: Mutex::new(None),
            handshake_complete: AtomicBool::new(false),
            last_stream_token: Mutex::new(Bytes::new()),
        }
    }

    pub async fn start(self: &Arc<Self>, delegate: Arc<dyn WriteStreamDelegate>) {
        self.handshake_complete.store(false, AtomicOrdering::SeqCst);
        *self.delegate.lock().await = Some(delegate);
        let listener: Arc<dyn StreamListener<WriteResponse>> = Arc::clone(self) as _;
        self.inner.start(listener).await;
    }

    /// Stops the stream. If the handshake had completed, first sends an
    /// empty write so the server finishes the stream cleanly.
    pub async fn stop(&self) {
        if self.is_open().await && self.handshake_complete() {
            let _ = self.write_mutations(Vec::new()).await;
        }
        self.inner.stop().await;
    }

    pub async fn is_started(&self) -> bool {
        self.inner.is_started().await
    }

    pub async fn is_open(&self) -> bool {
        self.inner.is_open().await
    }

    pub async fn inhibit_backoff(&self) {
        self.inner.inhibit_backoff().await;
    }

    pub async fn mark_idle(&self) {
        self.inner.mark_idle().await;
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete.load(AtomicOrdering::SeqCst)
    }

    pub async fn last_stream_token(&self) -> Bytes {
        self.last_stream_token.lock().await.clone()
    }

    /// Seeds the stream token, typically from local storage before the
    /// handshake so the server can pick up where the last session ended.
    pub async fn set_last_stream_token(&self, token: Bytes) {
        *self.last_stream_token.lock().await = token;
    }

    /// Sends the handshake. Must be the first message on every connection.
    pub async fn write_handshake(&self) -> FirestoreResult<()> {
        hard_assert(!self.handshake_complete(), "handshake already completed");
        self.inner.send(WriteRequest::Handshake).await
    }

    /// Sends a batch of mutations. Only valid after the handshake.
    pub async fn write_mutations(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        hard_assert(
            self.handshake_complete(),
            "writing mutations before the handshake completed",
        );
        let stream_token = self.last_stream_token().await;
        self.inner
            .send(WriteRequest::Writes {
                stream_token,
                mutations,
            })
            .await
    }
}

#[async_trait]
impl StreamListener<WriteResponse> for WriteStream {
    async fn on_open(&self) -> FirestoreResult<()> {
        // A fresh connection always starts with a new handshake.
        self.handshake_complete.store(false, AtomicOrdering::SeqCst);
        let delegate = self.delegate.lock().await.clone();
        match delegate {
            Some(delegate) => delegate.on_write_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_message(&self, message: WriteResponse) -> FirestoreResult<()> {
        *self.last_stream_token.lock().await = message.stream_token.clone();
        let delegate = self.delegate.lock().await.clone();
        let Some(delegate) = delegate else { return Ok(()) };
        if !self.handshake_complete() {
            hard_assert(
                message.write_results.is_empty(),
                "handshake response carried write results",
            );
            self.handshake_complete.store(true, AtomicOrdering::SeqCst);
            delegate.on_write_handshake_complete().await
        } else {
            delegate
                .on_write_response(message.commit_version, message.write_results)
                .await
        }
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let delegate = self.delegate.lock().await.clone();
        match delegate {
            Some(delegate) => delegate.on_write_stream_close(error).await,
            None => Ok(()),
        }
    }
}

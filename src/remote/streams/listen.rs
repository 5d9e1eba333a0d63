use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;

use crate::error::{FirestoreError, FirestoreResult};
use crate::local::target_data::TargetData;
use crate::model::collections::TargetId;
use crate::remote::connection::{
    Connection, ListenRequest, ListenResponse, WatchTargetRequest,
};
use crate::remote::datastore::CredentialsProvider;
use crate::remote::persistent_stream::{OpenStreamFn, PersistentStream, StreamListener};
use crate::util::async_queue::{AsyncQueue, TimerId};

/// Receives watch stream events, on the engine queue.
#[async_trait]
pub trait WatchStreamDelegate: Send + Sync {
    async fn on_watch_stream_open(&self) -> FirestoreResult<()>;
    async fn on_watch_stream_change(&self, response: ListenResponse) -> FirestoreResult<()>;
    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

/// The listen stream: registers interest in targets and receives watch
/// changes back until the targets are removed or the stream closes.
pub struct WatchStream {
    inner: Arc<PersistentStream<ListenRequest, ListenResponse>>,
    delegate: Mutex<Option<Arc<dyn WatchStreamDelegate>>>,
}

impl WatchStream {
    pub fn new(
        queue: AsyncQueue,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Self {
        let open_stream: OpenStreamFn<ListenRequest, ListenResponse> = Arc::new(move |token| {
            let connection = Arc::clone(&connection);
            Box::pin(async move { connection.open_listen_stream(token).await })
        });
        Self {
            inner: Arc::new(PersistentStream::new(
                queue,
                TimerId::ListenStreamConnectionBackoff,
                TimerId::ListenStreamIdle,
                credentials,
                open_stream,
            )),
            delegate: Mutex::new(None),
        }
    }

    pub async fn start(self: &Arc<Self>, delegate: Arc<dyn WatchStreamDelegate>) {
        *self.delegate.lock().await = Some(delegate);
        let listener: Arc<dyn StreamListener<ListenResponse>> = Arc::clone(self) as _;
        self.inner.start(listener).await;
    }

    pub async fn stop(&self) {
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

    /// Registers interest in `target_data`, resuming from its resume
    /// token if one is known.
    pub async fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        self.inner
            .send(ListenRequest::AddTarget(WatchTargetRequest {
                target: target_data.target.clone(),
                target_id: target_data.target_id,
                resume_token: target_data.resume_token.clone(),
            }))
            .await
    }

    /// Removes interest in `target_id`.
    pub async fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.inner.send(ListenRequest::RemoveTarget(target_id)).await
    }
}

#[async_trait]
impl StreamListener<ListenResponse> for WatchStream {
    async fn on_open(&self) -> FirestoreResult<()> {
        let delegate = self.delegate.lock().await.clone();
        match delegate {
            Some(delegate) => delegate.on_watch_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_message(&self, message: ListenResponse) -> FirestoreResult<()> {
        let delegate = self.delegate.lock().await.clone();
        match delegate {
            Some(delegate) => delegate.on_watch_stream_change(message).await,
            None => Ok(()),
        }
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let delegate = self.delegate.lock().await.clone();
        match delegate {
            Some(delegate) => delegate.on_watch_stream_close(error).await,
            None => Ok(()),
        }
    }
}

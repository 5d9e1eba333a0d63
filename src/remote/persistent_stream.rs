use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use futures::future::BoxFuture;
use log::{debug, error};

use crate::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::remote::connection::{StreamEvent, StreamHandle};
use crate::remote::datastore::CredentialsProvider;
use crate::util::assert::hard_assert;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::util::backoff::ExponentialBackoff;

/// How long a stream stays open with no activity before we close it to
/// free the connection.
pub const IDLE_TIMEOUT_MS: u64 = 60_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Not started, or stopped cleanly. `start` may be called.
    Initial,
    /// Fetching credentials and opening the transport stream.
    Starting,
    /// Connected and exchanging messages.
    Open,
    /// The stream closed abnormally. The next `start` backs off first.
    Error,
    /// Waiting out the backoff delay before reconnecting.
    Backoff,
}

/// Receives stream lifecycle events, always on the engine queue.
#[async_trait]
pub trait StreamListener<Resp>: Send + Sync {
    async fn on_open(&self) -> FirestoreResult<()>;
    async fn on_message(&self, message: Resp) -> FirestoreResult<()>;
    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

pub type OpenStreamFn<Req, Resp> = Arc<
    dyn Fn(Option<String>) -> BoxFuture<'static, FirestoreResult<Arc<dyn StreamHandle<Req, Resp>>>>
        + Send
        + Sync,
>;

struct StreamGuts<Req, Resp> {
    state: StreamState,
    handle: Option<Arc<dyn StreamHandle<Req, Resp>>>,
    listener: Option<Arc<dyn StreamListener<Resp>>>,
    idle_timer: Option<DelayedOperation>,
}

/// A restartable bidirectional stream with credential handling,
/// exponential reconnect backoff and an idle timeout.
///
/// Events from the transport are re-dispatched onto the engine queue and
/// tagged with a close generation, so callbacks belonging to a stream
/// that has since been closed are silently dropped rather than corrupting
/// the state machine.
pub struct PersistentStream<Req, Resp> {
    queue: AsyncQueue,
    idle_timer_id: TimerId,
    backoff: ExponentialBackoff,
    credentials: Arc<dyn CredentialsProvider>,
    open_stream: OpenStreamFn<Req, Resp>,
    close_count: AtomicU64,
    guts: Mutex<StreamGuts<Req, Resp>>,
}

impl<Req, Resp> PersistentStream<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
{
    pub fn new(
        queue: AsyncQueue,
        backoff_timer_id: TimerId,
        idle_timer_id: TimerId,
        credentials: Arc<dyn CredentialsProvider>,
        open_stream: OpenStreamFn<Req, Resp>,
    ) -> Self {
        Self {
            backoff: ExponentialBackoff::new(queue.clone(), backoff_timer_id),
            queue,
            idle_timer_id,
            credentials,
            open_stream,
            close_count: AtomicU64::new(0),
            guts: Mutex::new(StreamGuts {
                state: StreamState::Initial,
                handle: None,
                listener: None,
                idle_timer: None,
            }),
        }
    }

    /// Whether the stream has been started and not yet stopped. Streams in
    /// backoff count as started: they will reconnect on their own.
    pub async fn is_started(&self) -> bool {
        matches!(
            self.guts.lock().await.state,
            StreamState::Starting | StreamState::Open | StreamState::Backoff
        )
    }

    pub async fn is_open(&self) -> bool {
        self.guts.lock().await.state == StreamState::Open
    }

    /// Starts the stream, notifying `listener` once connected. If the
    /// previous run ended in an error the connect attempt waits out the
    /// current backoff delay first.
    pub async fn start(self: &Arc<Self>, listener: Arc<dyn StreamListener<Resp>>) {
        let state = {
            let mut guts = self.guts.lock().await;
            guts.listener = Some(listener);
            guts.state
        };
        if state == StreamState::Error {
            self.perform_backoff().await;
            return;
        }
        hard_assert(
            state == StreamState::Initial,
            "starting a stream that is already running",
        );
        self.connect().await;
    }

    /// Stops the stream and resets backoff. The listener still receives a
    /// final `on_close(None)`.
    pub async fn stop(self: &Arc<Self>) {
        if self.is_started().await {
            self.close(StreamState::Initial, None).await;
        }
    }

    /// Clears the error state so the next `start` connects immediately
    /// instead of waiting out the backoff delay.
    pub async fn inhibit_backoff(&self) {
        let mut guts = self.guts.lock().await;
        if guts.state == StreamState::Error {
            guts.state = StreamState::Initial;
        }
        self.backoff.reset();
    }

    /// Flags the stream as idle. Unless traffic resumes, the stream closes
    /// itself after [`IDLE_TIMEOUT_MS`].
    pub async fn mark_idle(self: &Arc<Self>) {
        let mut guts = self.guts.lock().await;
        if guts.state != StreamState::Open || guts.idle_timer.is_some() {
            return;
        }
        let stream = Arc::clone(self);
        guts.idle_timer = Some(self.queue.enqueue_after_delay(
            self.idle_timer_id,
            IDLE_TIMEOUT_MS,
            async move {
                stream.handle_idle_close_timer().await;
                Ok(())
            },
        ));
    }

    pub async fn send(&self, message: Req) -> FirestoreResult<()> {
        let handle = {
            let mut guts = self.guts.lock().await;
            if let Some(timer) = guts.idle_timer.take() {
                timer.cancel();
            }
            hard_assert(guts.state == StreamState::Open, "sending on a stream that is not open");
            guts.handle.clone()
        };
        match handle {
            Some(handle) => handle.send(message).await,
            None => Ok(()),
        }
    }

    async fn handle_idle_close_timer(self: &Arc<Self>) {
        let open = {
            let mut guts = self.guts.lock().await;
            guts.idle_timer = None;
            guts.state == StreamState::Open
        };
        if open {
            self.close(StreamState::Initial, None).await;
        }
    }

    async fn connect(self: &Arc<Self>) {
        self.guts.lock().await.state = StreamState::Starting;

        let generation = self.close_count.load(AtomicOrdering::SeqCst);
        let token = match self.credentials.get_token().await {
            Ok(token) => token,
            Err(err) => {
                if generation == self.close_count.load(AtomicOrdering::SeqCst) {
                    error!("failed to fetch auth token: {err}");
                    self.close(StreamState::Error, Some(err)).await;
                }
                return;
            }
        };
        if generation != self.close_count.load(AtomicOrdering::SeqCst) {
            // The stream was closed while the token fetch was in flight.
            return;
        }

        let handle = match (self.open_stream)(token).await {
            Ok(handle) => handle,
            Err(err) => {
                self.close(StreamState::Error, Some(err)).await;
                return;
            }
        };
        self.guts.lock().await.handle = Some(Arc::clone(&handle));

        // Pump transport events back onto the engine queue, tagged with
        // the generation they belong to.
        let stream = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = handle.next_event().await;
                let terminal = matches!(event, StreamEvent::Close(_));
                let dispatch = Arc::clone(&stream);
                stream.queue.enqueue_and_forget(async move {
                    dispatch.handle_event(generation, event).await;
                    Ok(())
                });
                if terminal {
                    break;
                }
            }
        });
    }

    async fn handle_event(self: &Arc<Self>, generation: u64, event: StreamEvent<Resp>) {
        if generation != self.close_count.load(AtomicOrdering::SeqCst) {
            debug!("dropping event for a closed stream");
            return;
        }
        match event {
            StreamEvent::Open => {
                let listener = {
                    let mut guts = self.guts.lock().await;
                    hard_assert(
                        guts.state == StreamState::Starting,
                        "stream opened while not in the starting state",
                    );
                    guts.state = StreamState::Open;
                    guts.listener.clone()
                };
                if let Some(listener) = listener {
                    if let Err(err) = listener.on_open().await {
                        self.close(StreamState::Error, Some(err)).await;
                    }
                }
            }
            StreamEvent::Message(message) => {
                let listener = self.guts.lock().await.listener.clone();
                if let Some(listener) = listener {
                    if let Err(err) = listener.on_message(message).await {
                        self.close(StreamState::Error, Some(err)).await;
                    }
                }
            }
            StreamEvent::Close(error) => {
                self.close(StreamState::Error, error).await;
            }
        }
    }

    async fn perform_backoff(self: &Arc<Self>) {
        self.guts.lock().await.state = StreamState::Backoff;
        let stream = Arc::clone(self);
        self.backoff.backoff_and_run(move || {
            Box::pin(async move {
                {
                    let mut guts = stream.guts.lock().await;
                    if guts.state != StreamState::Backoff {
                        // Stopped while waiting; nothing to reconnect.
                        return Ok(());
                    }
                    guts.state = StreamState::Initial;
                }
                stream.connect().await;
                Ok(())
            })
        });
    }

    /// Tears the stream down and notifies the listener. `final_state`
    /// decides what the next `start` does: `Initial` reconnects at once,
    /// `Error` backs off first.
    async fn close(self: &Arc<Self>, final_state: StreamState, error: Option<FirestoreError>) {
        let (handle, listener) = {
            let mut guts = self.guts.lock().await;
            hard_assert(
                !matches!(guts.state, StreamState::Initial),
                "closing a stream that was never started",
            );
            if let Some(timer) = guts.idle_timer.take() {
                timer.cancel();
            }
            self.backoff.cancel();
            self.close_count.fetch_add(1, AtomicOrdering::SeqCst);

            if final_state != StreamState::Error {
                self.backoff.reset();
            } else if let Some(err) = &error {
                if err.code == FirestoreErrorCode::ResourceExhausted {
                    error!("using maximum backoff delay to prevent overloading the backend: {err}");
                    self.backoff.reset_to_max();
                } else if err.code == FirestoreErrorCode::Unauthenticated {
                    // The token may have expired; fetch a new one on the
                    // next connection attempt.
                    self.credentials.invalidate_token();
                }
            }

            guts.state = final_state;
            (guts.handle.take(), guts.listener.clone())
        };
        if let Some(handle) = handle {
            handle.close().await;
        }
        if let Some(listener) = listener {
            if let Err(err) = listener.on_close(error).await {
                error!("stream close listener failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::unavailable;
    use crate::remote::datastore::EmptyCredentialsProvider;
    use async_channel::{unbounded, Receiver, Sender};
    use std::sync::atomic::AtomicUsize;

    struct FakeHandle {
        sent: Sender<String>,
        events: Receiver<StreamEvent<String>>,
    }

    #[async_trait]
    impl StreamHandle<String, String> for FakeHandle {
        async fn send(&self, message: String) -> FirestoreResult<()> {
            let _ = self.sent.send(message).await;
            Ok(())
        }

        async fn next_event(&self) -> StreamEvent<String> {
            match self.events.recv().await {
                Ok(event) => event,
                Err(_) => StreamEvent::Close(None),
            }
        }

        async fn close(&self) {
            self.events.close();
        }
    }

    struct Recorder {
        opens: AtomicUsize,
        messages: Mutex<Vec<String>>,
        closes: Mutex<Vec<Option<FirestoreError>>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                messages: Mutex::new(Vec::new()),
                closes: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StreamListener<String> for Recorder {
        async fn on_open(&self) -> FirestoreResult<()> {
            self.opens.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }

        async fn on_message(&self, message: String) -> FirestoreResult<()> {
            self.messages.lock().await.push(message);
            Ok(())
        }

        async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
            self.closes.lock().await.push(error);
            Ok(())
        }
    }

    fn fake_stream(
        queue: &AsyncQueue,
    ) -> (
        Arc<PersistentStream<String, String>>,
        Sender<StreamEvent<String>>,
        Receiver<String>,
        Arc<AtomicUsize>,
    ) {
        let (event_tx, event_rx) = unbounded();
        let (sent_tx, sent_rx) = unbounded();
        let open_count = Arc::new(AtomicUsize::new(0));
        let opens = Arc::clone(&open_count);
        let open_stream: OpenStreamFn<String, String> = Arc::new(move |_token| {
            opens.fetch_add(1, AtomicOrdering::SeqCst);
            let events = event_rx.clone();
            let sent = sent_tx.clone();
            Box::pin(async move {
                Ok(Arc::new(FakeHandle { sent, events }) as Arc<dyn StreamHandle<String, String>>)
            })
        });
        let stream = Arc::new(PersistentStream::new(
            queue.clone(),
            TimerId::ListenStreamConnectionBackoff,
            TimerId::ListenStreamIdle,
            Arc::new(EmptyCredentialsProvider),
            open_stream,
        ));
        (stream, event_tx, sent_rx, open_count)
    }

    #[tokio::test]
    async fn delivers_open_message_and_close_in_order() {
        let queue = AsyncQueue::new();
        let (stream, events, _sent, _opens) = fake_stream(&queue);
        let recorder = Recorder::new();
        stream.start(recorder.clone()).await;
        assert!(stream.is_started().await);

        events.send(StreamEvent::Open).await.ok();
        events.send(StreamEvent::Message("hello".into())).await.ok();
        events
            .send(StreamEvent::Close(Some(unavailable("lost connection"))))
            .await
            .ok();
        queue.drain().await;
        queue.drain().await;

        assert_eq!(recorder.opens.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(*recorder.messages.lock().await, vec!["hello".to_string()]);
        assert_eq!(recorder.closes.lock().await.len(), 1);
        assert!(!stream.is_started().await);
    }

    #[tokio::test]
    async fn restart_after_error_waits_for_backoff() {
        let queue = AsyncQueue::new();
        let (stream, events, _sent, opens) = fake_stream(&queue);
        let recorder = Recorder::new();
        stream.start(recorder.clone()).await;
        events.send(StreamEvent::Open).await.ok();
        events
            .send(StreamEvent::Close(Some(unavailable("boom"))))
            .await
            .ok();
        queue.drain().await;
        queue.drain().await;

        stream.start(recorder.clone()).await;
        // Connecting is deferred to the backoff timer.
        assert_eq!(opens.load(AtomicOrdering::SeqCst), 1);
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamConnectionBackoff));
        queue
            .run_delayed_operations_until(TimerId::ListenStreamConnectionBackoff)
            .await;
        assert_eq!(opens.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idle_timer_closes_an_open_stream() {
        let queue = AsyncQueue::new();
        let (stream, events, _sent, _opens) = fake_stream(&queue);
        let recorder = Recorder::new();
        stream.start(recorder.clone()).await;
        events.send(StreamEvent::Open).await.ok();
        queue.drain().await;
        assert!(stream.is_open().await);

        stream.mark_idle().await;
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        queue.run_delayed_operations_until(TimerId::ListenStreamIdle).await;
        assert!(!stream.is_started().await);
        assert_eq!(recorder.closes.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn sending_cancels_the_idle_timer() {
        let queue = AsyncQueue::new();
        let (stream, events, sent, _opens) = fake_stream(&queue);
        let recorder = Recorder::new();
        stream.start(recorder.clone()).await;
        events.send(StreamEvent::Open).await.ok();
        queue.drain().await;

        stream.mark_idle().await;
        stream.send("ping".into()).await.ok();
        assert!(!queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        assert_eq!(sent.recv().await.ok().as_deref(), Some("ping"));
    }

    #[tokio::test]
    async fn events_after_close_are_dropped() {
        let queue = AsyncQueue::new();
        let (stream, events, _sent, _opens) = fake_stream(&queue);
        let recorder = Recorder::new();
        stream.start(recorder.clone()).await;
        events.send(StreamEvent::Open).await.ok();
        queue.drain().await;

        stream.stop().await;
        events.send(StreamEvent::Message("stale".into())).await.ok();
        queue.drain().await;
        assert!(recorder.messages.lock().await.is_empty());
        // The clean stop still notified the listener exactly once.
        assert_eq!(recorder.closes.lock().await.len(), 1);
    }
}

use std::sync::Arc;

use async_lock::Mutex;
use futures::future::BoxFuture;
use log::{debug, warn};

use crate::error::{FirestoreError, FirestoreResult};
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

/// Connectivity as presented to views. `Unknown` is the initial state and
/// the state right after a first stream failure, before we are confident
/// the client is actually offline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    Unknown,
    Online,
    Offline,
}

/// Watch stream attempts tolerated before giving up and reporting
/// `Offline`.
const MAX_WATCH_STREAM_FAILURES: u32 = 2;

/// How long to stay `Unknown` while the first connection attempt is
/// outstanding before reporting `Offline`.
const ONLINE_STATE_TIMEOUT_MS: u64 = 10_000;

pub type OnlineStateHandler =
    Arc<dyn Fn(OnlineState) -> BoxFuture<'static, FirestoreResult<()>> + Send + Sync>;

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: u32,
    online_state_timer: Option<DelayedOperation>,
    /// The first transition to `Offline` logs at warn level so a
    /// misconfigured backend is visible; later flaps only log at debug.
    should_warn_client_is_offline: bool,
    handler: Option<OnlineStateHandler>,
}

/// Infers `OnlineState` from watch stream health and broadcasts changes.
/// Only the watch stream feeds this: write stream health is assumed to
/// correlate, and listens are what snapshots hang off of.
pub struct OnlineStateTracker {
    queue: AsyncQueue,
    state: Mutex<TrackerState>,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue) -> Self {
        Self {
            queue,
            state: Mutex::new(TrackerState {
                state: OnlineState::Unknown,
                watch_stream_failures: 0,
                online_state_timer: None,
                should_warn_client_is_offline: true,
                handler: None,
            }),
        }
    }

    pub async fn set_handler(&self, handler: OnlineStateHandler) {
        self.state.lock().await.handler = Some(handler);
    }

    /// Called when the watch stream starts connecting. Arms a timer that
    /// reports `Offline` if the stream does not become healthy in time.
    pub async fn handle_watch_stream_start(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.state != OnlineState::Unknown || state.online_state_timer.is_some() {
            return;
        }
        let tracker = Arc::clone(self);
        state.online_state_timer = Some(self.queue.enqueue_after_delay(
            TimerId::OnlineStateTimeout,
            ONLINE_STATE_TIMEOUT_MS,
            async move {
                {
                    let mut state = tracker.state.lock().await;
                    state.online_state_timer = None;
                    if state.state != OnlineState::Unknown {
                        return Ok(());
                    }
                    log_client_offline_warning_if_necessary(
                        &mut state,
                        &format!(
                            "Backend didn't respond within {} seconds.",
                            ONLINE_STATE_TIMEOUT_MS / 1000
                        ),
                    );
                }
                tracker.set_and_broadcast(OnlineState::Offline).await;
                Ok(())
            },
        ));
    }

    /// Called for each watch stream close while the network is enabled.
    /// A failure while `Online` only drops us back to `Unknown`; repeated
    /// failures from `Unknown` settle on `Offline`.
    pub async fn handle_watch_stream_failure(&self, error: &FirestoreError) {
        let broadcast = {
            let mut state = self.state.lock().await;
            match state.state {
                OnlineState::Online => {
                    state.watch_stream_failures = 0;
                    Some(OnlineState::Unknown)
                }
                _ => {
                    state.watch_stream_failures += 1;
                    if state.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
                        clear_online_state_timer(&mut state);
                        log_client_offline_warning_if_necessary(
                            &mut state,
                            &format!(
                                "Connection failed {} times. Most recent error: {}",
                                MAX_WATCH_STREAM_FAILURES, error
                            ),
                        );
                        Some(OnlineState::Offline)
                    } else {
                        None
                    }
                }
            }
        };
        if let Some(new_state) = broadcast {
            self.set_and_broadcast(new_state).await;
        }
    }

    /// Explicitly sets the state, e.g. `Online` once a watch message
    /// arrives or `Unknown`/`Offline` when the network is toggled.
    pub async fn set(&self, new_state: OnlineState) {
        {
            let mut state = self.state.lock().await;
            clear_online_state_timer(&mut state);
            state.watch_stream_failures = 0;
            if new_state == OnlineState::Online {
                // A healthy connection delivered a message, so the next
                // disconnect deserves a fresh warning.
                state.should_warn_client_is_offline = false;
            }
        }
        self.set_and_broadcast(new_state).await;
    }

    pub async fn online_state(&self) -> OnlineState {
        self.state.lock().await.state
    }

    async fn set_and_broadcast(&self, new_state: OnlineState) {
        let handler = {
            let mut state = self.state.lock().await;
            if state.state == new_state {
                return;
            }
            state.state = new_state;
            state.handler.clone()
        };
        if let Some(handler) = handler {
            if let Err(err) = handler(new_state).await {
                warn!("online state handler failed: {err}");
            }
        }
    }
}

fn clear_online_state_timer(state: &mut TrackerState) {
    if let Some(timer) = state.online_state_timer.take() {
        timer.cancel();
    }
}

fn log_client_offline_warning_if_necessary(state: &mut TrackerState, details: &str) {
    let message = format!(
        "Could not reach the backend. {} This typically indicates that your \
         device does not have a healthy internet connection at the moment. The \
         client will operate in offline mode until it is able to successfully \
         connect to the backend.",
        details
    );
    if state.should_warn_client_is_offline {
        warn!("{message}");
        state.should_warn_client_is_offline = false;
    } else {
        debug!("{message}");
    }
}

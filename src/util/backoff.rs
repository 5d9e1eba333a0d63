use std::time::Instant;

use async_lock::Mutex;
use futures::future::BoxFuture;
use rand::Rng;

use crate::error::FirestoreResult;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

pub const BACKOFF_INITIAL_DELAY_MS: u64 = 1_000;
pub const BACKOFF_FACTOR: f64 = 1.5;
pub const BACKOFF_MAX_DELAY_MS: u64 = 60_000;

struct BackoffState {
    /// Base delay for the next attempt, before jitter. Starts at zero so
    /// the first attempt runs immediately.
    current_base_ms: u64,
    last_attempt: Instant,
    timer: Option<DelayedOperation>,
}

/// Helper that schedules retries with randomized exponential delays.
///
/// Each `backoff_and_run` waits roughly the current base delay (jittered by
/// up to +/-50%), then grows the base by [`BACKOFF_FACTOR`] up to
/// [`BACKOFF_MAX_DELAY_MS`]. Time already spent since the previous attempt
/// counts against the wait.
pub struct ExponentialBackoff {
    queue: AsyncQueue,
    timer_id: TimerId,
    initial_delay_ms: u64,
    backoff_factor: f64,
    max_delay_ms: u64,
    state: Mutex<BackoffState>,
}

impl ExponentialBackoff {
    pub fn new(queue: AsyncQueue, timer_id: TimerId) -> Self {
        Self::with_delays(
            queue,
            timer_id,
            BACKOFF_INITIAL_DELAY_MS,
            BACKOFF_FACTOR,
            BACKOFF_MAX_DELAY_MS,
        )
    }

    pub fn with_delays(
        queue: AsyncQueue,
        timer_id: TimerId,
        initial_delay_ms: u64,
        backoff_factor: f64,
        max_delay_ms: u64,
    ) -> Self {
        Self {
            queue,
            timer_id,
            initial_delay_ms,
            backoff_factor,
            max_delay_ms,
            state: Mutex::new(BackoffState {
                current_base_ms: 0,
                last_attempt: Instant::now(),
                timer: None,
            }),
        }
    }

    /// Resets to the zero-delay state, so the next `backoff_and_run` fires
    /// immediately. Called after a connection proves healthy.
    pub fn reset(&self) {
        self.state.lock_blocking().current_base_ms = 0;
    }

    /// Jumps straight to the maximum delay, for failures that indicate
    /// sustained pushback (e.g. resource exhaustion).
    pub fn reset_to_max(&self) {
        self.state.lock_blocking().current_base_ms = self.max_delay_ms;
    }

    /// Cancels any scheduled run without resetting the delay.
    pub fn cancel(&self) {
        let mut state = self.state.lock_blocking();
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }

    /// Schedules `op` after the current backoff delay and advances the
    /// delay for the attempt after it. A previously scheduled run that has
    /// not fired yet is cancelled first.
    pub fn backoff_and_run<F>(&self, op: F)
    where
        F: FnOnce() -> BoxFuture<'static, FirestoreResult<()>> + Send + 'static,
    {
        let mut state = self.state.lock_blocking();
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }

        let base = state.current_base_ms;
        let elapsed = state.last_attempt.elapsed().as_millis() as u64;
        let delay_ms = jittered_delay_ms(base, elapsed);

        if delay_ms > 0 {
            log::debug!("backing off for {delay_ms} ms (base delay: {base} ms)");
        }
        state.last_attempt = Instant::now();
        state.timer = Some(
            self.queue
                .enqueue_after_delay(self.timer_id, delay_ms, async move { op().await }),
        );

        state.current_base_ms = ((state.current_base_ms as f64 * self.backoff_factor) as u64)
            .clamp(self.initial_delay_ms, self.max_delay_ms);
    }

    #[cfg(test)]
    fn current_base_ms(&self) -> u64 {
        self.state.lock_blocking().current_base_ms
    }
}

/// Jitters the base delay by a uniform offset in [-base/2, +base/2], then
/// credits time already spent since the previous attempt.
fn jittered_delay_ms(base_ms: u64, elapsed_ms: u64) -> u64 {
    let base = base_ms as i64;
    let jitter = if base == 0 {
        0
    } else {
        rand::thread_rng().gen_range(-(base / 2)..=(base / 2))
    };
    (base + jitter - elapsed_ms as i64).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn first_attempt_runs_immediately() {
        let queue = AsyncQueue::new();
        let backoff = ExponentialBackoff::new(queue.clone(), TimerId::AsyncQueueRetry);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        backoff.backoff_and_run(move || {
            Box::pin(async move {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        queue.run_delayed_operations_until(TimerId::AsyncQueueRetry).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn base_delay_grows_geometrically_within_bounds() {
        let queue = AsyncQueue::new();
        let backoff = ExponentialBackoff::new(queue.clone(), TimerId::AsyncQueueRetry);
        assert_eq!(backoff.current_base_ms(), 0);

        let mut expected: u64 = 0;
        for _ in 0..20 {
            backoff.backoff_and_run(|| Box::pin(async { Ok(()) }));
            expected = ((expected as f64 * BACKOFF_FACTOR) as u64)
                .clamp(BACKOFF_INITIAL_DELAY_MS, BACKOFF_MAX_DELAY_MS);
            assert_eq!(backoff.current_base_ms(), expected);
        }
        assert_eq!(backoff.current_base_ms(), BACKOFF_MAX_DELAY_MS);
        backoff.cancel();
    }

    #[tokio::test]
    async fn scheduled_delay_stays_within_the_jitter_envelope() {
        let queue = AsyncQueue::new();
        let backoff = ExponentialBackoff::new(queue.clone(), TimerId::AsyncQueueRetry);

        // Walk the base through several consecutive failures and sample the
        // delay each attempt would schedule.
        for _ in 0..8 {
            backoff.backoff_and_run(|| Box::pin(async { Ok(()) }));
            let base = backoff.current_base_ms();
            for _ in 0..100 {
                let delay = jittered_delay_ms(base, 0);
                assert!(
                    delay >= base - base / 2 && delay <= base + base / 2,
                    "delay {delay} ms outside [{}, {}] for base {base} ms",
                    base - base / 2,
                    base + base / 2,
                );
            }
        }
        backoff.cancel();

        // Time already spent since the last attempt is credited in full.
        assert_eq!(jittered_delay_ms(1_000, 10_000), 0);
    }

    #[tokio::test]
    async fn reset_and_reset_to_max() {
        let queue = AsyncQueue::new();
        let backoff = ExponentialBackoff::new(queue.clone(), TimerId::AsyncQueueRetry);
        backoff.backoff_and_run(|| Box::pin(async { Ok(()) }));
        backoff.cancel();
        assert!(backoff.current_base_ms() > 0);
        backoff.reset();
        assert_eq!(backoff.current_base_ms(), 0);
        backoff.reset_to_max();
        assert_eq!(backoff.current_base_ms(), BACKOFF_MAX_DELAY_MS);
    }

    #[tokio::test]
    async fn rescheduling_cancels_the_pending_run() {
        let queue = AsyncQueue::new();
        let backoff = ExponentialBackoff::new(queue.clone(), TimerId::AsyncQueueRetry);
        let ran = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&ran);
        backoff.backoff_and_run(move || {
            Box::pin(async move {
                first.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let second = Arc::clone(&ran);
        backoff.backoff_and_run(move || {
            Box::pin(async move {
                second.fetch_add(10, Ordering::SeqCst);
                Ok(())
            })
        });
        queue.run_delayed_operations_until(TimerId::All).await;
        // Only the second run fires.
        assert_eq!(ran.load(Ordering::SeqCst), 10);
    }
}

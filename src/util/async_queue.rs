use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_lock::Mutex;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::Future;

use crate::error::{internal_error, is_primary_lease_lost, FirestoreError, FirestoreResult};

/// Identifies the purpose of a delayed operation so tests and shutdown
/// paths can locate and force-run (or cancel) specific classes of timers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Sentinel accepted by `run_delayed_operations_until` to drain every
    /// scheduled timer regardless of id.
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    AsyncQueueRetry,
}

type QueueTask = BoxFuture<'static, ()>;

struct QueueInner {
    sender: async_channel::Sender<QueueTask>,
    failure: Mutex<Option<FirestoreError>>,
    delayed: Mutex<Vec<DelayedOperation>>,
    next_delayed_id: AtomicU64,
    created_at: Instant,
}

/// Serial-execution queue for all engine work.
///
/// Every operation enqueued here runs to completion before the next one
/// starts, so code running on the queue can treat engine state as
/// single-threaded. Once an operation fails with an unexpected error the
/// queue is poisoned and every later enqueue fails fast with that error;
/// a lost primary lease is the one error absorbed without poisoning.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
}

impl AsyncQueue {
    /// Creates a queue and spawns its worker task. Must be called from
    /// within a tokio runtime.
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded::<QueueTask>();
        tokio::spawn(async move {
            while let Ok(task) = receiver.recv().await {
                task.await;
            }
        });
        Self {
            inner: Arc::new(QueueInner {
                sender,
                failure: Mutex::new(None),
                delayed: Mutex::new(Vec::new()),
                next_delayed_id: AtomicU64::new(0),
                created_at: Instant::now(),
            }),
        }
    }

    fn now_ms(&self) -> u64 {
        self.inner.created_at.elapsed().as_millis() as u64
    }

    /// Schedules `op` behind everything already enqueued and returns a
    /// future resolving to its result.
    pub fn enqueue<T, F>(&self, op: F) -> impl Future<Output = FirestoreResult<T>>
    where
        T: Send + 'static,
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<FirestoreResult<T>>();
        if let Some(err) = self.inner.failure.lock_blocking().clone() {
            let _ = tx.send(Err(err));
        } else {
            let inner = Arc::clone(&self.inner);
            let task: QueueTask = Box::pin(async move {
                let result = op.await;
                if let Err(err) = &result {
                    if !is_primary_lease_lost(err) {
                        log::error!("operation on the async queue failed: {err}");
                        *inner.failure.lock().await = Some(err.clone());
                    }
                }
                let _ = tx.send(result);
            });
            let _ = self.inner.sender.try_send(task);
        }
        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(internal_error("async queue operation was dropped")),
            }
        }
    }

    /// Schedules `op` without waiting for its result. Failures still poison
    /// the queue.
    pub fn enqueue_and_forget<F>(&self, op: F)
    where
        F: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        drop(self.enqueue(op));
    }

    /// Runs `op` now and re-runs it with exponential backoff for as long as
    /// it keeps failing. Used for work that must eventually succeed, such
    /// as persisting stream acknowledgements.
    pub fn enqueue_retryable<F>(&self, op: F)
    where
        F: Fn() -> BoxFuture<'static, FirestoreResult<()>> + Send + Sync + 'static,
    {
        let backoff = Arc::new(crate::util::backoff::ExponentialBackoff::new(
            self.clone(),
            TimerId::AsyncQueueRetry,
        ));
        retry_with_backoff(backoff, Arc::new(op));
    }

    /// Schedules `op` to run after `delay_ms`. The returned handle can
    /// cancel the operation or force it to run immediately.
    pub fn enqueue_after_delay<F>(
        &self,
        timer_id: TimerId,
        delay_ms: u64,
        op: F,
    ) -> DelayedOperation
    where
        F: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let id = self.inner.next_delayed_id.fetch_add(1, AtomicOrdering::Relaxed);
        let handle = DelayedOperation {
            inner: Arc::new(DelayedInner {
                id,
                timer_id,
                target_time_ms: self.now_ms() + delay_ms,
                queue: self.clone(),
                op: Mutex::new(Some(Box::pin(op))),
            }),
        };
        self.inner.delayed.lock_blocking().push(handle.clone());
        let timer = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            timer.fire();
        });
        handle
    }

    /// Waits until every operation currently enqueued has run.
    pub async fn drain(&self) {
        let _ = self.enqueue(async { Ok(()) }).await;
    }

    /// Test hook: force-runs delayed operations in target-time order,
    /// draining the queue between each, until one with `last_timer_id` has
    /// run (or, for [`TimerId::All`], until no delayed operations remain).
    pub async fn run_delayed_operations_until(&self, last_timer_id: TimerId) {
        self.drain().await;
        loop {
            let next = {
                let delayed = self.inner.delayed.lock().await;
                delayed
                    .iter()
                    .min_by_key(|d| d.inner.target_time_ms)
                    .cloned()
            };
            let Some(op) = next else { break };
            op.skip_delay();
            self.drain().await;
            if last_timer_id != TimerId::All && op.timer_id() == last_timer_id {
                break;
            }
        }
    }

    /// Whether a delayed operation with the given timer id is pending.
    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner
            .delayed
            .lock_blocking()
            .iter()
            .any(|d| d.inner.timer_id == timer_id)
    }

    fn remove_delayed(&self, id: u64) {
        self.inner.delayed.lock_blocking().retain(|d| d.inner.id != id);
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn retry_with_backoff(
    backoff: Arc<crate::util::backoff::ExponentialBackoff>,
    op: Arc<dyn Fn() -> BoxFuture<'static, FirestoreResult<()>> + Send + Sync>,
) {
    let run_backoff = Arc::clone(&backoff);
    backoff.backoff_and_run(move || {
        let op = Arc::clone(&op);
        let backoff = Arc::clone(&run_backoff);
        Box::pin(async move {
            match op().await {
                Ok(()) => {}
                Err(err) => {
                    log::debug!("retryable operation failed, scheduling retry: {err}");
                    retry_with_backoff(backoff, op);
                }
            }
            Ok(())
        })
    });
}

struct DelayedInner {
    id: u64,
    timer_id: TimerId,
    target_time_ms: u64,
    queue: AsyncQueue,
    op: Mutex<Option<BoxFuture<'static, FirestoreResult<()>>>>,
}

/// Handle to an operation scheduled via `enqueue_after_delay`. Firing,
/// skipping and cancelling all race safely; whichever takes the stored
/// operation first wins and the rest are no-ops.
#[derive(Clone)]
pub struct DelayedOperation {
    inner: Arc<DelayedInner>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.inner.timer_id
    }

    /// Runs the operation now instead of waiting for its delay.
    pub fn skip_delay(&self) {
        self.fire();
    }

    /// Drops the operation without running it.
    pub fn cancel(&self) {
        let taken = self.inner.op.lock_blocking().take();
        if taken.is_some() {
            self.inner.queue.remove_delayed(self.inner.id);
        }
    }

    fn fire(&self) {
        let taken = self.inner.op.lock_blocking().take();
        if let Some(op) = taken {
            self.inner.queue.remove_delayed(self.inner.id);
            self.inner.queue.enqueue_and_forget(op);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn operations_run_in_enqueue_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            queue.enqueue_and_forget(async move {
                log.lock().await.push(i);
                Ok(())
            });
        }
        queue.drain().await;
        assert_eq!(*log.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failure_poisons_subsequent_operations() {
        let queue = AsyncQueue::new();
        let failed = queue
            .enqueue(async { Err::<(), _>(internal_error("boom")) })
            .await;
        assert!(failed.is_err());
        let next = queue.enqueue(async { Ok(42) }).await;
        match next {
            Err(err) => assert!(err.message().contains("boom")),
            Ok(_) => panic!("queue should be poisoned"),
        }
    }

    #[tokio::test]
    async fn primary_lease_loss_does_not_poison() {
        let queue = AsyncQueue::new();
        let _ = queue
            .enqueue(async { Err::<(), _>(crate::error::primary_lease_lost()) })
            .await;
        let next = queue.enqueue(async { Ok(7) }).await;
        assert_eq!(next.ok(), Some(7));
    }

    #[tokio::test]
    async fn delayed_operation_can_be_skipped() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        let op = queue.enqueue_after_delay(TimerId::OnlineStateTimeout, 60_000, async move {
            ran_clone.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        });
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        op.skip_delay();
        queue.drain().await;
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        // A second skip after firing is a no-op.
        op.skip_delay();
        queue.drain().await;
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_operation_never_runs() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        let op = queue.enqueue_after_delay(TimerId::ListenStreamIdle, 60_000, async move {
            ran_clone.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        });
        op.cancel();
        queue.run_delayed_operations_until(TimerId::All).await;
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_delayed_operations_until_respects_timer_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let log1 = Arc::clone(&log);
        queue.enqueue_after_delay(TimerId::WriteStreamIdle, 30_000, async move {
            log1.lock().await.push("write-idle");
            Ok(())
        });
        let log2 = Arc::clone(&log);
        queue.enqueue_after_delay(TimerId::OnlineStateTimeout, 10_000, async move {
            log2.lock().await.push("online-timeout");
            Ok(())
        });
        queue
            .run_delayed_operations_until(TimerId::OnlineStateTimeout)
            .await;
        // The earlier timer runs, the later one has not fired yet.
        assert_eq!(*log.lock().await, vec!["online-timeout"]);
        queue.run_delayed_operations_until(TimerId::All).await;
        assert_eq!(*log.lock().await, vec!["online-timeout", "write-idle"]);
    }

    #[tokio::test]
    async fn retryable_operations_retry_until_success() {
        let queue = AsyncQueue::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = Arc::clone(&attempts);
        queue.enqueue_retryable(move || {
            let attempts = Arc::clone(&attempts_clone);
            Box::pin(async move {
                if attempts.fetch_add(1, AtomicOrdering::SeqCst) < 2 {
                    Err(crate::error::unavailable("transient"))
                } else {
                    Ok(())
                }
            })
        });
        queue.run_delayed_operations_until(TimerId::All).await;
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 3);
    }
}

//! Per-key mailbox scheduler.
//!
//! The scheduler enforces FIFO execution per routing key while permitting
//! parallelism across keys. Each key gets a lazily created mailbox: an
//! ordered queue of pending jobs plus a `running` flag claiming the single
//! drain task allowed to execute that key. A drain task processes up to
//! `batch_count` jobs and then yields by re-submitting itself, so a busy
//! key cannot starve the others; when its queue is empty the mailbox is
//! destroyed.
//!
//! # Synchronization
//!
//! Locks are always taken map-then-mailbox. Enqueueing holds both, and the
//! drain task's clear-and-requeue decision holds both, so a wakeup can
//! never be lost: either the enqueue observes `running == true` and leaves
//! the job for the live drain task, or the drain task observes the
//! non-empty queue and re-submits. Neither lock is ever held across an
//! await.
//!
//! # Safety
//!
//! Job panics are caught and logged; they neither break the drain loop nor
//! leak the running flag.

use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// The function a drain task runs for each job.
pub type DrainFn<T> =
    Arc<dyn Fn(T) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct MailboxState<T> {
    queue: VecDeque<T>,
    running: bool,
}

struct Mailbox<T> {
    key: String,
    state: Mutex<MailboxState<T>>,
}

impl<T> Mailbox<T> {
    fn new(key: String) -> Self {
        Self {
            key,
            state: Mutex::new(MailboxState {
                queue: VecDeque::new(),
                running: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct SchedulerInner<T> {
    mailboxes: Mutex<HashMap<String, Arc<Mailbox<T>>>>,
    drain: DrainFn<T>,
    batch_count: usize,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl<T> SchedulerInner<T> {
    fn lock_map(&self) -> MutexGuard<'_, HashMap<String, Arc<Mailbox<T>>>> {
        self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn job_finished(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Routes jobs to per-key mailboxes and drains them with bounded batches.
///
/// `T` is the job type; the orchestrator uses `(MessageContext, LoadPermit)`
/// so backpressure capacity is released exactly when the job completes.
pub struct MailboxScheduler<T> {
    inner: Arc<SchedulerInner<T>>,
}

impl<T> Clone for MailboxScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> MailboxScheduler<T> {
    /// Create a scheduler draining at most `batch_count` jobs per mailbox
    /// turn with the given drain function.
    #[must_use]
    pub fn new(batch_count: usize, drain: DrainFn<T>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                mailboxes: Mutex::new(HashMap::new()),
                drain,
                batch_count: batch_count.max(1),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Enqueue a job under `key`, creating the key's mailbox if needed and
    /// starting a drain task if none is running.
    ///
    /// Linearization guarantee: for two jobs `x`, `y` with the same key
    /// where `x` was enqueued before `y`, the drain function for `x`
    /// completes before the one for `y` starts.
    pub fn process(&self, key: String, job: T) {
        let start = {
            let mut map = self.inner.lock_map();
            let mailbox = Arc::clone(
                map.entry(key.clone())
                    .or_insert_with(|| Arc::new(Mailbox::new(key))),
            );
            metrics::gauge!("mailboxes_active").set(map.len() as f64);

            // Enqueue under both locks so a concurrent drain finishing this
            // mailbox either sees the job or has already been removed.
            let mut state = mailbox.lock();
            state.queue.push_back(job);
            self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
            if state.running {
                None
            } else {
                state.running = true;
                Some(Arc::clone(&mailbox))
            }
        };

        if let Some(mailbox) = start {
            spawn_drain(Arc::clone(&self.inner), mailbox);
        }
    }

    /// Number of jobs enqueued or executing.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Number of live mailboxes.
    #[must_use]
    pub fn active_mailboxes(&self) -> usize {
        self.inner.lock_map().len()
    }

    /// Wait until every enqueued job has completed, up to `deadline`.
    ///
    /// Returns `true` if the scheduler drained fully; `false` if the
    /// deadline passed with work still in flight (those jobs keep running,
    /// but the caller should treat their messages as redeliverable).
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        let inner = Arc::clone(&self.inner);
        let drained = tokio::time::timeout(deadline, async move {
            loop {
                let notified = inner.idle.notified();
                if inner.in_flight.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok();

        if drained {
            tracing::info!("Mailbox scheduler drained");
        } else {
            tracing::warn!(
                in_flight = self.in_flight(),
                "Shutdown deadline passed with work in flight, messages will be redelivered"
            );
        }
        drained
    }
}

/// Run one drain batch for `mailbox`, then either re-submit (queue
/// non-empty) or clear the running flag and destroy the mailbox.
fn spawn_drain<T: Send + 'static>(inner: Arc<SchedulerInner<T>>, mailbox: Arc<Mailbox<T>>) {
    tokio::spawn(async move {
        let mut processed = 0;
        while processed < inner.batch_count {
            // Scope the guard so it is never held across the await below.
            let next = { mailbox.lock().queue.pop_front() };
            let Some(job) = next else {
                break;
            };

            let fut = (inner.drain)(job);
            if let Err(panic) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!(
                    key = %mailbox.key,
                    panic = %detail,
                    "Drain job panicked; mailbox continues"
                );
            }
            inner.job_finished();
            processed += 1;
        }

        // Batch done. Decide between yield-and-requeue and destruction under
        // the map->mailbox lock order used by process().
        let requeue = {
            let mut map = inner.lock_map();
            let mut state = mailbox.lock();
            if state.queue.is_empty() {
                state.running = false;
                map.remove(&mailbox.key);
                metrics::gauge!("mailboxes_active").set(map.len() as f64);
                false
            } else {
                true
            }
        };

        if requeue {
            spawn_drain(inner, mailbox);
        }
    });
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Mutex as AsyncMutex;

    fn recording_drain(
        log: Arc<AsyncMutex<Vec<String>>>,
        delay: Duration,
    ) -> DrainFn<String> {
        Arc::new(move |job: String| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                log.lock().await.push(job);
            })
        })
    }

    async fn wait_idle(scheduler: &MailboxScheduler<String>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("scheduler should drain");
    }

    #[tokio::test]
    async fn same_key_jobs_run_in_order() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let scheduler =
            MailboxScheduler::new(100, recording_drain(Arc::clone(&log), Duration::ZERO));

        for i in 0..20 {
            scheduler.process("K".to_string(), format!("job-{i}"));
        }
        wait_idle(&scheduler).await;

        let seen = log.lock().await.clone();
        let expected: Vec<String> = (0..20).map(|i| format!("job-{i}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn slow_job_blocks_only_its_own_key() {
        // A sleeping job on key A must not delay key B: distinct keys
        // progress in parallel while a second job on A waits.
        let running_a = Arc::new(AtomicBool::new(false));
        let b_done = Arc::new(AtomicBool::new(false));
        let overlap_seen = Arc::new(AtomicBool::new(false));

        let drain: DrainFn<String> = {
            let running_a = Arc::clone(&running_a);
            let b_done = Arc::clone(&b_done);
            let overlap_seen = Arc::clone(&overlap_seen);
            Arc::new(move |job: String| {
                let running_a = Arc::clone(&running_a);
                let b_done = Arc::clone(&b_done);
                let overlap_seen = Arc::clone(&overlap_seen);
                Box::pin(async move {
                    if job == "a" {
                        running_a.store(true, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        running_a.store(false, Ordering::SeqCst);
                    } else {
                        if running_a.load(Ordering::SeqCst) {
                            overlap_seen.store(true, Ordering::SeqCst);
                        }
                        b_done.store(true, Ordering::SeqCst);
                    }
                })
            })
        };

        let scheduler = MailboxScheduler::new(100, drain);
        scheduler.process("A".to_string(), "a".to_string());
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.process("B".to_string(), "b".to_string());

        tokio::time::timeout(Duration::from_secs(2), async {
            while scheduler.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("scheduler should drain");

        assert!(b_done.load(Ordering::SeqCst));
        assert!(
            overlap_seen.load(Ordering::SeqCst),
            "B should have run while A was still sleeping"
        );
    }

    #[tokio::test]
    async fn serial_execution_within_key_with_sleeping_handler() {
        // Same-key version of the above: the second job must not start
        // until the first completes.
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let drain: DrainFn<String> = {
            let log = Arc::clone(&log);
            Arc::new(move |job: String| {
                let log = Arc::clone(&log);
                Box::pin(async move {
                    log.lock().await.push(format!("start-{job}"));
                    if job == "first" {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    log.lock().await.push(format!("end-{job}"));
                })
            })
        };

        let scheduler = MailboxScheduler::new(100, drain);
        scheduler.process("K".to_string(), "first".to_string());
        scheduler.process("K".to_string(), "second".to_string());

        tokio::time::timeout(Duration::from_secs(2), async {
            while scheduler.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("scheduler should drain");

        let seen = log.lock().await.clone();
        assert_eq!(seen, vec!["start-first", "end-first", "start-second", "end-second"]);
    }

    #[tokio::test]
    async fn mailboxes_destroyed_after_drain() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let scheduler =
            MailboxScheduler::new(10, recording_drain(Arc::clone(&log), Duration::ZERO));

        for key in ["A", "B", "C"] {
            scheduler.process(key.to_string(), format!("job-{key}"));
        }
        wait_idle(&scheduler).await;
        // The drain task removes the mailbox under the map lock right after
        // the last job, but give the spawned tasks a beat to finish.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(scheduler.active_mailboxes(), 0);
    }

    #[tokio::test]
    async fn batch_exhaustion_requeues_without_losing_jobs() {
        // batch_count = 2 forces multiple drain turns for one key.
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let scheduler =
            MailboxScheduler::new(2, recording_drain(Arc::clone(&log), Duration::ZERO));

        for i in 0..9 {
            scheduler.process("K".to_string(), format!("j{i}"));
        }
        wait_idle(&scheduler).await;

        let seen = log.lock().await.clone();
        assert_eq!(seen.len(), 9);
        let expected: Vec<String> = (0..9).map(|i| format!("j{i}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn panic_in_job_does_not_leak_running_flag() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let drain: DrainFn<String> = {
            let log = Arc::clone(&log);
            Arc::new(move |job: String| {
                let log = Arc::clone(&log);
                Box::pin(async move {
                    if job == "boom" {
                        panic!("handler exploded");
                    }
                    log.lock().await.push(job);
                })
            })
        };

        let scheduler = MailboxScheduler::new(100, drain);
        scheduler.process("K".to_string(), "boom".to_string());
        scheduler.process("K".to_string(), "after".to_string());

        tokio::time::timeout(Duration::from_secs(2), async {
            while scheduler.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("scheduler should drain past the panic");

        assert_eq!(log.lock().await.clone(), vec!["after"]);
        assert_eq!(scheduler.active_mailboxes(), 0);
    }

    #[tokio::test]
    async fn shutdown_reports_unfinished_work() {
        let drain: DrainFn<String> = Arc::new(|_job| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
            })
        });

        let scheduler = MailboxScheduler::new(100, drain);
        scheduler.process("K".to_string(), "slow".to_string());

        let drained = scheduler.shutdown(Duration::from_millis(50)).await;
        assert!(!drained);
    }
}

//! In-flight load gate with hysteresis.
//!
//! The orchestrator acquires one permit per delivered message before
//! handing it to the mailbox scheduler, and the permit is released when the
//! pipeline finishes with the message. Once the in-flight count reaches
//! `full_load_threshold`, `acquire` parks the caller — which stops the
//! consumer polling the queue — and ingress resumes only after the count
//! drops below `full_load_threshold - low_water`. The hysteresis margin
//! avoids rapid pause/resume flapping around the threshold.
//!
//! Memory use is bounded regardless of burst size: the queue adapter's own
//! delivery buffer plus `full_load_threshold` contexts is all the consumer
//! ever holds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug)]
struct GateState {
    in_flight: usize,
    saturated: bool,
}

/// Hysteresis admission gate bounding in-flight work.
#[derive(Debug)]
pub struct LoadGate {
    state: Mutex<GateState>,
    notify: Notify,
    threshold: usize,
    resume_below: usize,
    /// Lifetime acquisitions, for tests and diagnostics.
    admitted: AtomicUsize,
}

impl LoadGate {
    /// Create a gate admitting at most `threshold` concurrent permits,
    /// resuming a saturated gate once the count drops below
    /// `threshold - low_water`.
    #[must_use]
    pub fn new(threshold: usize, low_water: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            state: Mutex::new(GateState {
                in_flight: 0,
                saturated: false,
            }),
            notify: Notify::new(),
            threshold,
            resume_below: threshold.saturating_sub(low_water).max(1),
            admitted: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire a permit, waiting while the gate is saturated.
    pub async fn acquire(self: &Arc<Self>) -> LoadPermit {
        loop {
            // Register interest before checking, so a release between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            if self.try_acquire() {
                return LoadPermit {
                    gate: Arc::clone(self),
                };
            }
            notified.await;
        }
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        if state.saturated {
            return false;
        }
        state.in_flight += 1;
        if state.in_flight >= self.threshold {
            state.saturated = true;
            tracing::debug!(
                in_flight = state.in_flight,
                threshold = self.threshold,
                "Load gate saturated, pausing ingress"
            );
        }
        self.admitted.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("in_flight_messages").set(state.in_flight as f64);
        true
    }

    fn release(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        metrics::gauge!("in_flight_messages").set(state.in_flight as f64);
        if state.saturated && state.in_flight < self.resume_below {
            state.saturated = false;
            drop(state);
            tracing::debug!("Load gate drained below low water, resuming ingress");
            self.notify.notify_waiters();
        }
    }

    /// Current number of outstanding permits.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Whether the gate is currently refusing admissions.
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.lock().saturated
    }

    /// Lifetime count of admitted permits.
    #[must_use]
    pub fn admitted(&self) -> usize {
        self.admitted.load(Ordering::Relaxed)
    }
}

/// A held admission; releasing (dropping) it frees capacity and may resume
/// ingress.
#[derive(Debug)]
pub struct LoadPermit {
    gate: Arc<LoadGate>,
}

impl Drop for LoadPermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used)] // Tests can panic for assertions
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn admits_up_to_threshold() {
        let gate = Arc::new(LoadGate::new(3, 0));

        let _a = gate.acquire().await;
        let _b = gate.acquire().await;
        let _c = gate.acquire().await;

        assert_eq!(gate.in_flight(), 3);
        assert!(gate.is_saturated());
    }

    #[tokio::test]
    async fn blocks_at_threshold_until_release() {
        let gate = Arc::new(LoadGate::new(2, 0));

        let a = gate.acquire().await;
        let _b = gate.acquire().await;

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let _c = gate.acquire().await;
            })
        };

        // The fourth acquire must not complete while saturated.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(a);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be admitted after release")
            .expect("waiter should not panic");
    }

    #[tokio::test]
    async fn hysteresis_resumes_only_below_low_water() {
        let gate = Arc::new(LoadGate::new(4, 2));

        let mut permits = vec![
            gate.acquire().await,
            gate.acquire().await,
            gate.acquire().await,
            gate.acquire().await,
        ];
        assert!(gate.is_saturated());

        // Dropping one permit leaves in_flight = 3, still >= resume point (2).
        drop(permits.pop());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(gate.is_saturated());

        // Dropping another brings in_flight to 2, which is not yet below 2.
        drop(permits.pop());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(gate.is_saturated());

        // in_flight = 1 < resume_below = 2: gate opens.
        drop(permits.pop());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!gate.is_saturated());

        let _again = gate.acquire().await;
        assert_eq!(gate.in_flight(), 2);
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_threshold_under_contention() {
        let gate = Arc::new(LoadGate::new(5, 1));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let gate = Arc::clone(&gate);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _permit = gate.acquire().await;
                let now = gate.in_flight();
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }

        assert!(peak.load(Ordering::SeqCst) <= 5);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.admitted(), 50);
    }
}

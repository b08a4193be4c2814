//! Outbox relay: republishes envelopes the inline publish missed.
//!
//! The pipeline publishes envelopes best-effort right after the commit and
//! marks the successes dispatched. Anything left — broker hiccup, crash
//! between commit and publish — sits in the outbox with `dispatched_at`
//! null. The relay polls for those rows in insertion order and retries
//! them, making transport publication at-least-once overall. Downstream
//! consumers dedupe by `envelope_id`.

use mailroom_core::queue::QueueClient;
use mailroom_core::store::{MessageStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Background republisher for undispatched outbox rows.
///
/// # Example
///
/// ```ignore
/// let (mut relay, shutdown) = OutboxRelay::new(store, queue, Duration::from_secs(1));
/// tokio::spawn(async move { relay.run().await });
/// // ... later:
/// shutdown.send(true).ok();
/// ```
pub struct OutboxRelay {
    store: Arc<dyn MessageStore>,
    queue: Arc<dyn QueueClient>,
    poll_interval: Duration,
    batch_size: u32,
    shutdown: watch::Receiver<bool>,
}

impl OutboxRelay {
    /// Create a relay polling every `poll_interval`.
    ///
    /// Returns the relay and a shutdown sender; send `true` to stop it.
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        queue: Arc<dyn QueueClient>,
        poll_interval: Duration,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let relay = Self {
            store,
            queue,
            poll_interval,
            batch_size: 100,
            shutdown: shutdown_rx,
        };
        (relay, shutdown_tx)
    }

    /// Set the maximum rows fetched per poll.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Poll and republish until shutdown.
    pub async fn run(&mut self) {
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis(),
            batch_size = self.batch_size,
            "Outbox relay started"
        );

        loop {
            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {},
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                },
            }

            match self.dispatch_once().await {
                Ok(0) => {},
                Ok(count) => {
                    tracing::debug!(count, "Relayed undispatched envelopes");
                },
                Err(e) => {
                    tracing::error!(error = %e, "Outbox relay poll failed");
                },
            }
        }

        tracing::info!("Outbox relay stopped");
    }

    /// Fetch one batch of undispatched envelopes, publish them in
    /// insertion order, and mark the successes. Returns how many were
    /// dispatched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the outbox cannot be read or updated;
    /// publish failures are logged and retried on the next poll.
    pub async fn dispatch_once(&self) -> Result<usize, StoreError> {
        let pending = self.store.fetch_undispatched(self.batch_size).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut dispatched = Vec::with_capacity(pending.len());
        for envelope in &pending {
            match self.queue.publish(envelope).await {
                Ok(()) => {
                    dispatched.push(envelope.envelope_id);
                    metrics::counter!("outbox_envelopes_published_total").increment(1);
                },
                Err(e) => {
                    metrics::counter!("outbox_publish_errors_total").increment(1);
                    tracing::warn!(
                        envelope_id = %envelope.envelope_id,
                        destination = envelope.destination(),
                        error = %e,
                        "Relay publish failed, will retry next poll"
                    );
                },
            }
        }

        if !dispatched.is_empty() {
            self.store.mark_dispatched(&dispatched).await?;
        }
        Ok(dispatched.len())
    }
}

impl std::fmt::Debug for OutboxRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxRelay")
            .field("poll_interval", &self.poll_interval)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

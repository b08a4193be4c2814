//! Consumer configuration.

use crate::retry::RetryPolicy;
use std::time::Duration;

/// Configuration for a [`CommandConsumer`](crate::consumer::CommandConsumer).
///
/// # Defaults
///
/// - `full_load_threshold`: 1000 in-flight messages
/// - `low_water`: 100 (ingress resumes at `full_load_threshold - low_water`)
/// - `wait_interval`: 1 second (idle poll / relay interval)
/// - `mailbox_batch_count`: 100 messages per mailbox drain batch
/// - `handler_timeout`: none
/// - `retry`: [`RetryPolicy::default`]
/// - `shutdown_deadline`: 30 seconds
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Queue (topic) the consumer reads commands from.
    pub command_queue: String,
    /// Consumer group identifying this worker fleet; also used as the
    /// producer tag on outbound envelopes.
    pub consumer_group: String,
    /// Maximum number of in-flight messages (enqueued + executing).
    pub full_load_threshold: usize,
    /// Hysteresis margin: once saturated, ingress resumes only when the
    /// in-flight count drops to `full_load_threshold - low_water`.
    pub low_water: usize,
    /// Idle wait between poll cycles where the transport needs one.
    pub wait_interval: Duration,
    /// Maximum messages a mailbox drains before yielding to other keys.
    pub mailbox_batch_count: usize,
    /// Per-command handler timeout; a timeout is a non-retryable failure.
    pub handler_timeout: Option<Duration>,
    /// Retry policy for optimistic-concurrency conflicts.
    pub retry: RetryPolicy,
    /// How long `stop` waits for in-flight mailboxes to drain. Contexts
    /// still pending after the deadline are not offset-committed and will
    /// be redelivered.
    pub shutdown_deadline: Duration,
}

impl ConsumerConfig {
    /// Create a configuration with defaults for the given queue and group.
    #[must_use]
    pub fn new(command_queue: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            command_queue: command_queue.into(),
            consumer_group: consumer_group.into(),
            full_load_threshold: 1000,
            low_water: 100,
            wait_interval: Duration::from_secs(1),
            mailbox_batch_count: 100,
            handler_timeout: None,
            retry: RetryPolicy::default(),
            shutdown_deadline: Duration::from_secs(30),
        }
    }

    /// Set the in-flight threshold.
    ///
    /// # Panics
    ///
    /// Panics if `threshold` is 0.
    #[must_use]
    #[allow(clippy::panic)] // Misconfiguration is a programming error
    pub fn with_full_load_threshold(mut self, threshold: usize) -> Self {
        assert!(threshold > 0, "full_load_threshold must be greater than 0");
        self.full_load_threshold = threshold;
        self.low_water = self.low_water.min(threshold.saturating_sub(1));
        self
    }

    /// Set the hysteresis margin.
    #[must_use]
    pub fn with_low_water(mut self, low_water: usize) -> Self {
        self.low_water = low_water.min(self.full_load_threshold.saturating_sub(1));
        self
    }

    /// Set the idle wait interval.
    #[must_use]
    pub const fn with_wait_interval(mut self, interval: Duration) -> Self {
        self.wait_interval = interval;
        self
    }

    /// Set the mailbox drain batch size.
    ///
    /// # Panics
    ///
    /// Panics if `count` is 0.
    #[must_use]
    #[allow(clippy::panic)] // Misconfiguration is a programming error
    pub fn with_mailbox_batch_count(mut self, count: usize) -> Self {
        assert!(count > 0, "mailbox_batch_count must be greater than 0");
        self.mailbox_batch_count = count;
        self
    }

    /// Set the per-command handler timeout.
    #[must_use]
    pub const fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Set the conflict retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the shutdown drain deadline.
    #[must_use]
    pub const fn with_shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.shutdown_deadline = deadline;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ConsumerConfig::new("commands", "billing");

        assert_eq!(config.command_queue, "commands");
        assert_eq!(config.consumer_group, "billing");
        assert_eq!(config.full_load_threshold, 1000);
        assert_eq!(config.low_water, 100);
        assert_eq!(config.wait_interval, Duration::from_secs(1));
        assert_eq!(config.mailbox_batch_count, 100);
        assert!(config.handler_timeout.is_none());
        assert_eq!(config.shutdown_deadline, Duration::from_secs(30));
    }

    #[test]
    fn low_water_clamped_below_threshold() {
        let config = ConsumerConfig::new("commands", "billing")
            .with_full_load_threshold(10)
            .with_low_water(50);

        assert_eq!(config.low_water, 9);
    }
}

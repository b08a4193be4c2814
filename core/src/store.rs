//! Message store abstraction: durable record of handled commands, failed
//! commands, and the transactional outbox.
//!
//! The store is the half of the exactly-once contract that the queue cannot
//! provide. A handled-command record exists **iff** every envelope the
//! handling produced is durably in the outbox — `save_command` writes both
//! in a single transaction. Together with the idempotency probe this gives
//! exactly-once effective semantics under arbitrary redelivery.
//!
//! Implementations: `PostgresMessageStore` (production, `mailroom-postgres`)
//! and `InMemoryMessageStore` (testing, `mailroom-testing`).

use crate::envelope::OutboundEnvelope;
use crate::message::MessageContext;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors from message store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A write raced a concurrent writer on the same aggregate (version
    /// check or serialization failure). The pipeline retries iff the
    /// command carries `need_retry`.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// The handled-command uniqueness constraint fired: another consumer
    /// committed this command between the idempotency probe and the save.
    #[error("Command '{message_id}' already handled by group '{consumer_group}'")]
    DuplicateCommand {
        /// The duplicated message id.
        message_id: String,
        /// The consumer group that already handled it.
        consumer_group: String,
    },

    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Adapter contract for the durable message store.
///
/// # Concurrency contract
///
/// Writes racing on the same aggregate may surface
/// [`StoreError::ConcurrencyConflict`]. `save_command` must be atomic:
/// either the handled-command record and every outbox row land together,
/// or none do.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the store can be shared as
/// `Arc<dyn MessageStore>` between the pipeline and the outbox relay.
pub trait MessageStore: Send + Sync {
    /// Idempotency probe: whether a prior handling of `message_id` by
    /// `consumer_group` has been durably committed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the probe cannot be answered;
    /// the pipeline then leaves the offset uncommitted so the message is
    /// redelivered.
    fn has_command_handled(
        &self,
        message_id: &str,
        consumer_group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + '_>>;

    /// Atomically persist the handled-command record and the outbox rows
    /// for all envelopes, in envelope order.
    ///
    /// # Errors
    ///
    /// - [`StoreError::ConcurrencyConflict`]: version conflict; retryable.
    /// - [`StoreError::DuplicateCommand`]: lost idempotency race; the
    ///   pipeline treats the command as a duplicate.
    /// - [`StoreError::Database`] / [`StoreError::Serialization`]: the
    ///   transaction did not commit.
    fn save_command<'a>(
        &'a self,
        ctx: &'a MessageContext,
        envelopes: &'a [OutboundEnvelope],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    /// Record a failed handling plus any publish-anyway and reply
    /// envelopes, in a transaction separate from the failed attempt's
    /// rolled-back one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the failure record cannot be
    /// written; the pipeline then leaves the offset uncommitted.
    fn save_failed_command<'a>(
        &'a self,
        ctx: &'a MessageContext,
        error_type: &'a str,
        error_message: &'a str,
        envelopes: &'a [OutboundEnvelope],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    /// Release any scope-local uncommitted state. Called on the failure
    /// path before the failure record is written; stores without
    /// scope-local staging implement this as a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if releasing staged state fails.
    fn rollback(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Fetch up to `limit` outbox envelopes that have not been dispatched,
    /// oldest first (insertion order).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    fn fetch_undispatched(
        &self,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboundEnvelope>, StoreError>> + Send + '_>>;

    /// Mark the given outbox envelopes as dispatched. Unknown ids are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on update failure.
    fn mark_dispatched<'a>(
        &'a self,
        envelope_ids: &'a [Uuid],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_conflict_error_display() {
        let error = StoreError::ConcurrencyConflict("expected version 5, found 7".to_string());
        let display = format!("{error}");
        assert!(display.contains("Concurrency conflict"));
        assert!(display.contains("expected version 5"));
    }

    #[test]
    fn duplicate_command_error_display() {
        let error = StoreError::DuplicateCommand {
            message_id: "m-1".to_string(),
            consumer_group: "billing".to_string(),
        };
        let display = format!("{error}");
        assert!(display.contains("m-1"));
        assert!(display.contains("billing"));
    }
}

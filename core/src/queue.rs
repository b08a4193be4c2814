//! Queue client abstraction: the adapter contract between the consumer and
//! the message transport.
//!
//! Implementations wrap a concrete broker client (Kafka/Redpanda in
//! `mailroom-redpanda`, an in-memory queue in `mailroom-testing`). The core
//! consumes exactly three operations: subscribe to a command queue, commit
//! an offset, and publish an outbound envelope.
//!
//! # Ordering contract
//!
//! Messages bearing the same `routing_key` MUST be delivered in producer
//! order within a single consumer generation. Cross-key ordering is
//! unspecified. Adapters keying broker partitions by `routing_key` satisfy
//! this for free.
//!
//! # Commit discipline
//!
//! `commit` marks the token's offset and all lower offsets on the same
//! partition as durably consumed. An adapter MUST NOT move the committed
//! watermark past an offset that was delivered but not yet committed, even
//! when commits arrive out of order across keys; see the offset tracker in
//! `mailroom-redpanda` for the reference implementation.
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of `async fn` so the
//! client can be shared as `Arc<dyn QueueClient>` across the orchestrator,
//! the pipeline, and the outbox relay.

use crate::envelope::OutboundEnvelope;
use crate::message::{CommitToken, MessageContext};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from queue client operations.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// Failed to connect to the broker.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an envelope.
    #[error("Publish failed for destination '{destination}': {reason}")]
    PublishFailed {
        /// The topic or endpoint that failed.
        destination: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to subscribe to the command queue.
    #[error("Subscription failed for queue '{queue}': {reason}")]
    SubscriptionFailed {
        /// The queue that failed to subscribe.
        queue: String,
        /// The reason for failure.
        reason: String,
    },

    /// A delivered record could not be decoded into a command message.
    #[error("Malformed message at {token}: {reason}")]
    MalformedMessage {
        /// Where the record came from.
        token: CommitToken,
        /// Why decoding failed.
        reason: String,
    },

    /// Failed to commit an offset.
    #[error("Commit failed for {token}: {reason}")]
    CommitFailed {
        /// The token that failed to commit.
        token: CommitToken,
        /// The reason for failure.
        reason: String,
    },

    /// Network or transport error. The adapter handles reconnection; the
    /// consumer logs and keeps reading.
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Stream of delivered command contexts.
pub type CommandStream =
    Pin<Box<dyn Stream<Item = Result<MessageContext, QueueError>> + Send>>;

/// Adapter contract for the message transport.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the client is shared between the
/// consumer loop (subscribe), every mailbox drain task (publish, commit),
/// and the outbox relay (publish).
pub trait QueueClient: Send + Sync {
    /// Subscribe to a command queue under a consumer group.
    ///
    /// Delivery begins when the returned stream is polled and stops when
    /// the stream is dropped; in-flight deliveries drain. Backpressure is
    /// the caller's job — the orchestrator stops polling the stream while
    /// the in-flight load gate is saturated, which pauses the underlying
    /// consumer.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::SubscriptionFailed`] if the subscription
    /// cannot be established.
    fn subscribe(
        &self,
        queue: &str,
        consumer_group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<CommandStream, QueueError>> + Send + '_>>;

    /// Mark this token's offset and all lower offsets on its partition as
    /// durably consumed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::CommitFailed`] if the commit cannot be
    /// recorded. Callers log and continue: the worst case is redelivery,
    /// which the idempotency store absorbs.
    fn commit(
        &self,
        token: &CommitToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Publish an outbound envelope to its destination, keyed by its
    /// partition key.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::PublishFailed`] if the broker rejects the
    /// record or the send times out.
    fn publish(
        &self,
        envelope: &OutboundEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;
}

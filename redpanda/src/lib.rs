//! Redpanda/Kafka queue client for Mailroom.
//!
//! Implements the [`QueueClient`] contract over rdkafka: a
//! manual-commit `StreamConsumer` for command ingress and a
//! `FutureProducer` for outbound envelopes.
//!
//! # Delivery semantics
//!
//! At-least-once with manual offset commits:
//! - Offsets are committed only when the pipeline acknowledges a context,
//!   and only up to the contiguous per-partition watermark (see
//!   [`OffsetTracker`]) — a later offset never commits ahead of an earlier
//!   in-flight one.
//! - A crash before commit redelivers the unfinished messages; the
//!   consumer's idempotency store absorbs the duplicates.
//! - Records that cannot be decoded into a command message are surfaced as
//!   stream errors and their offsets committed, so poison records cannot
//!   wedge a partition.
//!
//! # Ordering
//!
//! Commands are produced keyed by `routing_key` and outbound envelopes by
//! their partition key, so broker partition ordering lines up with the
//! consumer's per-key serialization.
//!
//! # Example
//!
//! ```no_run
//! use mailroom_redpanda::RedpandaQueueClient;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RedpandaQueueClient::builder()
//!     .brokers("localhost:9092")
//!     .producer_acks("all")
//!     .compression("lz4")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod offset;

pub use offset::OffsetTracker;

use mailroom_core::envelope::OutboundEnvelope;
use mailroom_core::message::{CommandMessage, CommitToken, MessageContext};
use mailroom_core::queue::{CommandStream, QueueClient, QueueError};
use rdkafka::Offset;
use rdkafka::TopicPartitionList;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Kafka/Redpanda implementation of the [`QueueClient`] contract.
pub struct RedpandaQueueClient {
    /// Kafka producer for outbound envelopes
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer send timeout
    timeout: Duration,
    /// Delivery buffer between the Kafka consumer and the orchestrator
    buffer_size: usize,
    /// Auto offset reset policy for new consumer groups
    auto_offset_reset: String,
    /// Contiguous-watermark tracker driving commits
    tracker: Arc<OffsetTracker>,
    /// The live consumer, set by `subscribe`
    consumer: Mutex<Option<Arc<StreamConsumer>>>,
}

impl RedpandaQueueClient {
    /// Create a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if the producer cannot be
    /// created.
    pub fn new(brokers: &str) -> Result<Self, QueueError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the client.
    #[must_use]
    pub fn builder() -> RedpandaQueueClientBuilder {
        RedpandaQueueClientBuilder::default()
    }

    /// Broker addresses this client talks to.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn lock_consumer(&self) -> MutexGuard<'_, Option<Arc<StreamConsumer>>> {
        self.consumer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Produce a command message onto a command queue, keyed by its
    /// routing key. This is the producer-side counterpart of `subscribe`,
    /// used by command producers and tests.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::PublishFailed`] if the record cannot be
    /// produced.
    pub async fn send_command(
        &self,
        queue: &str,
        message: &CommandMessage,
    ) -> Result<(), QueueError> {
        let payload = message.to_bytes().map_err(|e| QueueError::PublishFailed {
            destination: queue.to_string(),
            reason: format!("Failed to serialize command message: {e}"),
        })?;
        let key = if message.routing_key.is_empty() {
            message.message_id.as_str()
        } else {
            message.routing_key.as_str()
        };

        let record = FutureRecord::to(queue).payload(&payload).key(key.as_bytes());
        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => {
                tracing::debug!(
                    queue,
                    partition,
                    offset,
                    message_id = %message.message_id,
                    "Command produced"
                );
                Ok(())
            },
            Err((kafka_error, _)) => Err(QueueError::PublishFailed {
                destination: queue.to_string(),
                reason: kafka_error.to_string(),
            }),
        }
    }
}

/// Builder for configuring a [`RedpandaQueueClient`].
#[derive(Default)]
pub struct RedpandaQueueClientBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaQueueClientBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1", or "all".
    ///
    /// Default: "1"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the delivery buffer size between the Kafka consumer and the
    /// orchestrator. Once the orchestrator stops polling (load gate
    /// saturated), at most this many messages are buffered before the
    /// consumer itself stops reading.
    ///
    /// Default: 1000
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` is 0.
    #[must_use]
    #[allow(clippy::panic)] // Misconfiguration is a programming error
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be greater than 0");
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Set where new consumer groups start reading: "earliest", "latest",
    /// or "error".
    ///
    /// Default: "earliest" — a new command consumer must not skip commands
    /// produced before its first start.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaQueueClient`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if brokers are not set or
    /// the producer cannot be created.
    pub fn build(self) -> Result<RedpandaQueueClient, QueueError> {
        let brokers = self
            .brokers
            .ok_or_else(|| QueueError::ConnectionFailed("Brokers not configured".to_string()))?;

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", self.producer_acks.as_deref().unwrap_or("1"))
            .set(
                "compression.type",
                self.compression.as_deref().unwrap_or("none"),
            );

        let producer: FutureProducer = producer_config.create().map_err(|e| {
            QueueError::ConnectionFailed(format!("Failed to create producer: {e}"))
        })?;

        tracing::info!(
            brokers = %brokers,
            acks = self.producer_acks.as_deref().unwrap_or("1"),
            compression = self.compression.as_deref().unwrap_or("none"),
            buffer_size = self.buffer_size.unwrap_or(1000),
            auto_offset_reset = self.auto_offset_reset.as_deref().unwrap_or("earliest"),
            "RedpandaQueueClient created"
        );

        Ok(RedpandaQueueClient {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            tracker: Arc::new(OffsetTracker::new()),
            consumer: Mutex::new(None),
        })
    }
}

impl QueueClient for RedpandaQueueClient {
    fn subscribe(
        &self,
        queue: &str,
        consumer_group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<CommandStream, QueueError>> + Send + '_>> {
        let queue = queue.to_string();
        let consumer_group = consumer_group.to_string();
        let brokers = self.brokers.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();
        let tracker = Arc::clone(&self.tracker);

        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &consumer_group)
                .set("enable.auto.commit", "false") // Manual commit for at-least-once
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| QueueError::SubscriptionFailed {
                    queue: queue.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            consumer
                .subscribe(&[queue.as_str()])
                .map_err(|e| QueueError::SubscriptionFailed {
                    queue: queue.clone(),
                    reason: format!("Failed to subscribe: {e}"),
                })?;

            let consumer = Arc::new(consumer);
            *self.lock_consumer() = Some(Arc::clone(&consumer));

            tracing::info!(
                queue = %queue,
                consumer_group = %consumer_group,
                buffer_size,
                manual_commit = true,
                "Subscribed to command queue"
            );

            // Forward decoded contexts over a bounded channel. When the
            // orchestrator stops draining the channel (backpressure), this
            // task parks on `send` and the consumer stops polling.
            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);
            let forward_group = consumer_group.clone();
            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();
                while let Some(record) = stream.next().await {
                    match record {
                        Ok(record) => {
                            let token = CommitToken {
                                topic: record.topic().to_string(),
                                partition: record.partition(),
                                offset: record.offset(),
                            };
                            tracker.track(&token.topic, token.partition, token.offset);

                            let decoded = record
                                .payload()
                                .ok_or_else(|| "record has no payload".to_string())
                                .and_then(|payload| {
                                    CommandMessage::from_bytes(payload)
                                        .map_err(|e| e.to_string())
                                });

                            match decoded {
                                Ok(message) => {
                                    tracing::trace!(
                                        token = %token,
                                        message_id = %message.message_id,
                                        "Command received"
                                    );
                                    let ctx = MessageContext::new(
                                        message,
                                        token,
                                        forward_group.clone(),
                                    );
                                    if tx.send(Ok(ctx)).await.is_err() {
                                        // Receiver dropped: consumer stopped.
                                        break;
                                    }
                                },
                                Err(reason) => {
                                    // Poison record: report it, then commit
                                    // past it so the partition keeps moving.
                                    let err = QueueError::MalformedMessage {
                                        token: token.clone(),
                                        reason,
                                    };
                                    if tx.send(Err(err)).await.is_err() {
                                        break;
                                    }
                                    if let Some(next) = tracker.ack(
                                        &token.topic,
                                        token.partition,
                                        token.offset,
                                    ) {
                                        commit_watermark(&consumer, &token.topic, token.partition, next);
                                    }
                                },
                            }
                        },
                        Err(e) => {
                            let err =
                                QueueError::TransportError(format!("Failed to receive: {e}"));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        },
                    }
                }
                tracing::debug!("Consumer forwarding task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as CommandStream)
        })
    }

    fn commit(
        &self,
        token: &CommitToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let token = token.clone();
        Box::pin(async move {
            let Some(consumer) = self.lock_consumer().clone() else {
                return Err(QueueError::CommitFailed {
                    token,
                    reason: "not subscribed".to_string(),
                });
            };

            // Only the contiguous prefix is committable; acks above a gap
            // are held until the gap closes.
            let Some(next) = self.tracker.ack(&token.topic, token.partition, token.offset)
            else {
                tracing::trace!(token = %token, "Ack recorded, watermark unchanged");
                return Ok(());
            };

            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&token.topic, token.partition, Offset::Offset(next))
                .map_err(|e| QueueError::CommitFailed {
                    token: token.clone(),
                    reason: e.to_string(),
                })?;

            consumer
                .commit(&tpl, CommitMode::Async)
                .map_err(|e| QueueError::CommitFailed {
                    token: token.clone(),
                    reason: e.to_string(),
                })?;

            tracing::trace!(token = %token, watermark = next, "Offsets committed");
            Ok(())
        })
    }

    fn publish(
        &self,
        envelope: &OutboundEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let envelope = envelope.clone();
        let timeout = self.timeout;
        Box::pin(async move {
            let destination = envelope.destination().to_string();
            let payload = envelope.to_bytes().map_err(|e| QueueError::PublishFailed {
                destination: destination.clone(),
                reason: format!("Failed to serialize envelope: {e}"),
            })?;
            let key = envelope.partition_key().as_bytes().to_vec();

            let record = FutureRecord::to(&destination).payload(&payload).key(&key);
            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        destination = %destination,
                        partition,
                        offset,
                        envelope_id = %envelope.envelope_id,
                        "Envelope published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        destination = %destination,
                        error = %kafka_error,
                        "Failed to publish envelope"
                    );
                    Err(QueueError::PublishFailed {
                        destination,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }
}

fn commit_watermark(consumer: &StreamConsumer, topic: &str, partition: i32, next: i64) {
    let mut tpl = TopicPartitionList::new();
    if tpl
        .add_partition_offset(topic, partition, Offset::Offset(next))
        .is_ok()
    {
        if let Err(e) = consumer.commit(&tpl, CommitMode::Async) {
            tracing::warn!(
                topic,
                partition,
                watermark = next,
                error = %e,
                "Failed to commit past poison record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaQueueClient>();
        assert_sync::<RedpandaQueueClient>();
    }

    #[test]
    fn builder_requires_brokers() {
        let result = RedpandaQueueClient::builder().build();
        assert!(matches!(result, Err(QueueError::ConnectionFailed(_))));
    }
}

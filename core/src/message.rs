//! Inbound command messages and consumer-side message contexts.
//!
//! A [`CommandMessage`] is the unit a producer puts on the command queue:
//! a globally unique id, a routing key that orders related commands, the
//! typed payload, and optional reply/saga routing. The queue adapter wraps
//! each delivered message in a [`MessageContext`] carrying the
//! consumer-side metadata and the [`CommitToken`] used to acknowledge the
//! message once handling is durable.
//!
//! Messages are bincode-serialized as the record value on the wire, keyed
//! by `routing_key` so the broker's partition ordering aligns with the
//! consumer's per-key serialization.

use crate::command::{CodecError, Command};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A typed payload: stable type name plus bincode-encoded body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Wire identifier of the encoded type (e.g. `"TransferFunds.v1"`).
    pub type_name: String,
    /// The bincode-serialized body.
    pub body: Vec<u8>,
}

/// Saga correlation data attached to a command by a saga coordinator.
///
/// The saga id is opaque to the consumer; it is only copied onto outbound
/// envelopes so replies and events route back to the coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaInfo {
    /// Opaque saga correlation id.
    pub saga_id: String,
    /// Endpoint (topic) the saga coordinator listens on for results.
    pub reply_endpoint: String,
}

/// A command message as produced onto the command queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Globally unique, producer-generated message id. This is the
    /// idempotency key: a command is effectively handled at most once per
    /// consumer group for a given id.
    pub message_id: String,
    /// Key along which related commands are serialized, e.g. an aggregate
    /// id. May be empty, in which case the consumer falls back to
    /// per-message ordering.
    pub routing_key: String,
    /// The typed command payload.
    pub payload: Payload,
    /// Topic to send the handling reply to, if the producer wants one.
    pub reply_endpoint: Option<String>,
    /// Saga correlation, if this command is part of a saga.
    pub saga_info: Option<SagaInfo>,
    /// Whether the consumer should retry on an optimistic-concurrency
    /// conflict.
    pub need_retry: bool,
    /// Name of the producing service.
    pub producer: String,
}

impl CommandMessage {
    /// Create a message for a typed command.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialization`] if the command cannot be
    /// encoded.
    pub fn new<C: Command>(
        message_id: impl Into<String>,
        routing_key: impl Into<String>,
        command: &C,
        producer: impl Into<String>,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            message_id: message_id.into(),
            routing_key: routing_key.into(),
            payload: command.to_payload()?,
            reply_endpoint: None,
            saga_info: None,
            need_retry: false,
            producer: producer.into(),
        })
    }

    /// Request a reply to the given endpoint.
    #[must_use]
    pub fn with_reply_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.reply_endpoint = Some(endpoint.into());
        self
    }

    /// Attach saga correlation data.
    #[must_use]
    pub fn with_saga(mut self, saga_info: SagaInfo) -> Self {
        self.saga_info = Some(saga_info);
        self
    }

    /// Mark the command as retryable on optimistic-concurrency conflicts.
    #[must_use]
    pub const fn with_need_retry(mut self, need_retry: bool) -> Self {
        self.need_retry = need_retry;
        self
    }

    /// Decode the payload as a typed command.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TypeMismatch`] or
    /// [`CodecError::Deserialization`] if the payload does not carry `C`.
    pub fn command<C: Command>(&self) -> Result<C, CodecError> {
        C::from_payload(&self.payload)
    }

    /// Serialize the message for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialization`] on encoding failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    /// Deserialize a message from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Deserialization`] on decoding failure.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Deserialization(e.to_string()))
    }
}

/// Opaque, comparable acknowledgement token assigned by the queue adapter.
///
/// Tokens on the same `(topic, partition)` are totally ordered by offset;
/// committing a token marks it and all lower offsets on that partition as
/// durably consumed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitToken {
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
}

impl fmt::Display for CommitToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A command message wrapped with consumer-side metadata.
///
/// Owned by the orchestrator until handed to a mailbox, by the mailbox
/// until the pipeline returns, and by the pipeline for the offset commit.
#[derive(Clone, Debug)]
pub struct MessageContext {
    /// The delivered message.
    pub message: CommandMessage,
    /// The acknowledgement token for this delivery.
    pub token: CommitToken,
    /// Consumer group this context was delivered to.
    pub consumer_group: String,
    /// When the consumer received the message.
    pub received_at: DateTime<Utc>,
}

impl MessageContext {
    /// Create a context for a delivered message.
    #[must_use]
    pub fn new(
        message: CommandMessage,
        token: CommitToken,
        consumer_group: impl Into<String>,
    ) -> Self {
        Self {
            message,
            token,
            consumer_group: consumer_group.into(),
            received_at: Utc::now(),
        }
    }

    /// The message id, shorthand for `self.message.message_id`.
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message.message_id
    }

    /// The key this context serializes under: the routing key, or the
    /// message id when the routing key is empty.
    #[must_use]
    pub fn ordering_key(&self) -> &str {
        if self.message.routing_key.is_empty() {
            &self.message.message_id
        } else {
            &self.message.routing_key
        }
    }

    /// Whether the producer asked for a reply.
    #[must_use]
    pub const fn reply_requested(&self) -> bool {
        self.message.reply_endpoint.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Test code uses expect for clear failure messages
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    impl Command for Ping {
        const TYPE_NAME: &'static str = "Ping.v1";
    }

    fn context(routing_key: &str, message_id: &str) -> MessageContext {
        let message = CommandMessage::new(message_id, routing_key, &Ping { n: 1 }, "tests")
            .expect("encoding should succeed");
        MessageContext::new(
            message,
            CommitToken {
                topic: "commands".to_string(),
                partition: 0,
                offset: 7,
            },
            "group-a",
        )
    }

    #[test]
    fn message_wire_roundtrip() {
        let message = CommandMessage::new("m-1", "acct-1", &Ping { n: 3 }, "tests")
            .expect("encoding should succeed")
            .with_reply_endpoint("replies")
            .with_saga(SagaInfo {
                saga_id: "saga-1".to_string(),
                reply_endpoint: "saga-replies".to_string(),
            })
            .with_need_retry(true);

        let bytes = message.to_bytes().expect("serialization should succeed");
        let decoded =
            CommandMessage::from_bytes(&bytes).expect("deserialization should succeed");

        assert_eq!(decoded.message_id, "m-1");
        assert_eq!(decoded.reply_endpoint.as_deref(), Some("replies"));
        assert!(decoded.need_retry);
        assert_eq!(decoded.command::<Ping>().expect("decode"), Ping { n: 3 });
    }

    #[test]
    fn ordering_key_falls_back_to_message_id() {
        assert_eq!(context("acct-1", "m-1").ordering_key(), "acct-1");
        assert_eq!(context("", "m-2").ordering_key(), "m-2");
    }

    proptest::proptest! {
        #[test]
        fn ordering_key_is_routing_key_iff_nonempty(
            routing_key in "[a-z0-9-]{0,12}",
            message_id in "[a-z0-9-]{1,12}",
        ) {
            let ctx = context(&routing_key, &message_id);
            if routing_key.is_empty() {
                proptest::prop_assert_eq!(ctx.ordering_key(), message_id);
            } else {
                proptest::prop_assert_eq!(ctx.ordering_key(), routing_key);
            }
        }
    }

    #[test]
    fn commit_tokens_order_by_offset_within_partition() {
        let low = CommitToken {
            topic: "commands".to_string(),
            partition: 0,
            offset: 3,
        };
        let high = CommitToken {
            topic: "commands".to_string(),
            partition: 0,
            offset: 9,
        };
        assert!(low < high);
        assert_eq!(format!("{low}"), "commands[0]@3");
    }
}

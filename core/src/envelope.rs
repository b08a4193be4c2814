//! Outbound envelopes: events and replies produced by command handling.
//!
//! Every envelope is persisted to the outbox in the same transaction as the
//! handled-command record, then published to the queue best-effort; a
//! background relay replays anything the inline publish missed. The outbox
//! row is therefore the source of truth and transport publish is
//! at-least-once — downstream consumers must dedupe by `envelope_id`.

use crate::command::{CodecError, DomainEvent};
use crate::message::{MessageContext, Payload, SagaInfo};
use crate::scope::RaisedEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event raised by a handler, wrapped for transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique id of this event instance.
    pub event_id: Uuid,
    /// Id of the command whose handling produced the event.
    pub source_command_id: String,
    /// Destination topic, from the event's registered topic.
    pub topic: String,
    /// Partition key, from the event's key.
    pub key: String,
    /// Saga correlation copied from the source command, if any.
    pub saga_info: Option<SagaInfo>,
    /// Name of the producing consumer.
    pub producer: String,
    /// The typed event payload.
    pub payload: Payload,
}

/// The body of a reply envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyBody {
    /// The handler completed and set this (possibly empty) reply value.
    Handled(Vec<u8>),
    /// The command was already handled; no work was performed.
    DuplicatelyHandled,
    /// No handler is registered for the command type.
    NoHandlerExists,
    /// Handling failed; carries the serialized failure.
    Failure {
        /// Classification of the failure (e.g. `"Domain"`, `"System"`).
        error_type: String,
        /// Human-readable failure message.
        message: String,
    },
}

/// A reply routed back to the command producer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// Correlation id, always the source command's message id.
    pub correlation_id: String,
    /// Destination endpoint (the command's `reply_endpoint`, or the saga
    /// coordinator's endpoint for saga results).
    pub endpoint: String,
    /// Name of the producing consumer.
    pub producer: String,
    /// The reply body.
    pub body: ReplyBody,
}

/// The kind of an outbound envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// A domain event.
    Event(EventEnvelope),
    /// A reply to the producer or a saga coordinator.
    Reply(ReplyEnvelope),
}

/// An outbound envelope as persisted in the outbox and published to the
/// queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    /// Unique envelope id, the outbox primary key and downstream dedupe
    /// key.
    pub envelope_id: Uuid,
    /// The wrapped content.
    pub kind: EnvelopeKind,
}

impl OutboundEnvelope {
    /// Wrap a raised event for the given source context.
    #[must_use]
    pub fn wrap_event(ctx: &MessageContext, raised: RaisedEvent, producer: &str) -> Self {
        let event_id = Uuid::new_v4();
        Self {
            envelope_id: event_id,
            kind: EnvelopeKind::Event(EventEnvelope {
                event_id,
                source_command_id: ctx.message.message_id.clone(),
                topic: raised.topic,
                key: raised.key,
                saga_info: ctx.message.saga_info.clone(),
                producer: producer.to_string(),
                payload: Payload {
                    type_name: raised.event_type,
                    body: raised.body,
                },
            }),
        }
    }

    /// Wrap a reply to the context's `reply_endpoint`.
    ///
    /// Returns `None` when the producer did not request a reply.
    #[must_use]
    pub fn wrap_reply(ctx: &MessageContext, body: ReplyBody, producer: &str) -> Option<Self> {
        let endpoint = ctx.message.reply_endpoint.clone()?;
        Some(Self {
            envelope_id: Uuid::new_v4(),
            kind: EnvelopeKind::Reply(ReplyEnvelope {
                correlation_id: ctx.message.message_id.clone(),
                endpoint,
                producer: producer.to_string(),
                body,
            }),
        })
    }

    /// Wrap a saga result to the saga coordinator's endpoint.
    ///
    /// Returns `None` when the command carries no saga info, the saga id is
    /// empty, or the coordinator endpoint is empty.
    #[must_use]
    pub fn wrap_saga_result(ctx: &MessageContext, result: Vec<u8>, producer: &str) -> Option<Self> {
        let saga = ctx.message.saga_info.as_ref()?;
        if saga.saga_id.is_empty() || saga.reply_endpoint.is_empty() {
            return None;
        }
        Some(Self {
            envelope_id: Uuid::new_v4(),
            kind: EnvelopeKind::Reply(ReplyEnvelope {
                correlation_id: ctx.message.message_id.clone(),
                endpoint: saga.reply_endpoint.clone(),
                producer: producer.to_string(),
                body: ReplyBody::Handled(result),
            }),
        })
    }

    /// The topic or endpoint this envelope publishes to.
    #[must_use]
    pub fn destination(&self) -> &str {
        match &self.kind {
            EnvelopeKind::Event(event) => &event.topic,
            EnvelopeKind::Reply(reply) => &reply.endpoint,
        }
    }

    /// The partition key for publishing: the event key, or the correlation
    /// id for replies.
    #[must_use]
    pub fn partition_key(&self) -> &str {
        match &self.kind {
            EnvelopeKind::Event(event) => &event.key,
            EnvelopeKind::Reply(reply) => &reply.correlation_id,
        }
    }

    /// Id of the command whose handling produced this envelope.
    #[must_use]
    pub fn source_command_id(&self) -> &str {
        match &self.kind {
            EnvelopeKind::Event(event) => &event.source_command_id,
            EnvelopeKind::Reply(reply) => &reply.correlation_id,
        }
    }

    /// Whether this envelope is an event (as opposed to a reply).
    #[must_use]
    pub const fn is_event(&self) -> bool {
        matches!(self.kind, EnvelopeKind::Event(_))
    }

    /// Serialize the envelope for the wire and the outbox.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialization`] on encoding failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    /// Deserialize an envelope from wire or outbox bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Deserialization`] on decoding failure.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Deserialization(e.to_string()))
    }

    /// Decode an event envelope's payload as a typed event.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Deserialization`] if this is not an event
    /// envelope of type `E` or the body cannot be decoded.
    pub fn event<E: DomainEvent + serde::de::DeserializeOwned>(&self) -> Result<E, CodecError> {
        match &self.kind {
            EnvelopeKind::Event(event) => bincode::deserialize(&event.payload.body)
                .map_err(|e| CodecError::Deserialization(e.to_string())),
            EnvelopeKind::Reply(_) => Err(CodecError::Deserialization(
                "envelope is a reply, not an event".to_string(),
            )),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::message::{CommandMessage, CommitToken};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Noop;

    impl Command for Noop {
        const TYPE_NAME: &'static str = "Noop.v1";
    }

    fn context(reply: Option<&str>, saga: Option<SagaInfo>) -> MessageContext {
        let mut message =
            CommandMessage::new("cmd-1", "k-1", &Noop, "tests").expect("encoding should succeed");
        message.reply_endpoint = reply.map(String::from);
        message.saga_info = saga;
        MessageContext::new(
            message,
            CommitToken {
                topic: "commands".to_string(),
                partition: 0,
                offset: 0,
            },
            "group-a",
        )
    }

    fn raised() -> RaisedEvent {
        RaisedEvent {
            event_type: "Credited.v1".to_string(),
            topic: "ledger-events".to_string(),
            key: "acct-1".to_string(),
            body: vec![1, 2, 3],
        }
    }

    #[test]
    fn wrapped_event_carries_source_and_saga() {
        let saga = SagaInfo {
            saga_id: "saga-1".to_string(),
            reply_endpoint: "saga-replies".to_string(),
        };
        let ctx = context(None, Some(saga.clone()));

        let envelope = OutboundEnvelope::wrap_event(&ctx, raised(), "worker-1");

        assert!(envelope.is_event());
        assert_eq!(envelope.destination(), "ledger-events");
        assert_eq!(envelope.partition_key(), "acct-1");
        assert_eq!(envelope.source_command_id(), "cmd-1");
        match &envelope.kind {
            EnvelopeKind::Event(event) => {
                assert_eq!(event.saga_info.as_ref(), Some(&saga));
                assert_eq!(event.producer, "worker-1");
            },
            EnvelopeKind::Reply(_) => unreachable!("wrapped an event"),
        }
    }

    #[test]
    fn wrap_reply_requires_endpoint() {
        let without = context(None, None);
        assert!(OutboundEnvelope::wrap_reply(&without, ReplyBody::DuplicatelyHandled, "w").is_none());

        let with = context(Some("replies"), None);
        let envelope = OutboundEnvelope::wrap_reply(&with, ReplyBody::NoHandlerExists, "w")
            .expect("endpoint is set");
        assert_eq!(envelope.destination(), "replies");
        assert_eq!(envelope.partition_key(), "cmd-1");
    }

    #[test]
    fn wrap_saga_result_requires_nonempty_saga() {
        let no_saga = context(None, None);
        assert!(OutboundEnvelope::wrap_saga_result(&no_saga, vec![1], "w").is_none());

        let empty_id = context(
            None,
            Some(SagaInfo {
                saga_id: String::new(),
                reply_endpoint: "saga-replies".to_string(),
            }),
        );
        assert!(OutboundEnvelope::wrap_saga_result(&empty_id, vec![1], "w").is_none());

        let full = context(
            None,
            Some(SagaInfo {
                saga_id: "saga-1".to_string(),
                reply_endpoint: "saga-replies".to_string(),
            }),
        );
        let envelope = OutboundEnvelope::wrap_saga_result(&full, vec![9], "w")
            .expect("saga info is complete");
        assert_eq!(envelope.destination(), "saga-replies");
    }

    #[test]
    fn envelope_wire_roundtrip() {
        let ctx = context(Some("replies"), None);
        let envelope = OutboundEnvelope::wrap_reply(
            &ctx,
            ReplyBody::Failure {
                error_type: "Domain".to_string(),
                message: "insufficient funds".to_string(),
            },
            "worker-1",
        )
        .expect("endpoint is set");

        let bytes = envelope.to_bytes().expect("serialization should succeed");
        let decoded =
            OutboundEnvelope::from_bytes(&bytes).expect("deserialization should succeed");
        assert_eq!(decoded.envelope_id, envelope.envelope_id);
        assert_eq!(decoded.destination(), "replies");
    }
}

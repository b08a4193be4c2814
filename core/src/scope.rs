//! Per-command scope and its in-memory event collector.
//!
//! A [`CommandScope`] is built fresh for every delivered command and
//! dropped when the pipeline completes. It holds the [`ScopedEventBus`]
//! into which the handler raises events, the reply slot, and an extensions
//! bag through which an application can share per-command resources (for
//! example a repository unit-of-work handle) without any ambient/global
//! lookup.
//!
//! Neither type is `Sync`-shared: the scope is owned by the single mailbox
//! drain step executing the command, so no locking is needed.

use crate::command::{CodecError, DomainEvent};
use crate::message::{MessageContext, SagaInfo};
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;

/// An event raised into the scope, captured in serialized form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaisedEvent {
    /// Wire identifier of the event type.
    pub event_type: String,
    /// Destination topic.
    pub topic: String,
    /// Partition key.
    pub key: String,
    /// bincode-serialized event body.
    pub body: Vec<u8>,
}

impl RaisedEvent {
    fn capture<E: DomainEvent>(event: &E) -> Result<Self, CodecError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            topic: event.topic().to_string(),
            key: event.key(),
            body: event.to_bytes()?,
        })
    }
}

/// Everything the handler raised during one attempt, drained exactly once
/// when the pipeline builds the outbox batch.
#[derive(Debug, Default)]
pub struct EventBusSnapshot {
    /// Events to publish on success only.
    pub events: Vec<RaisedEvent>,
    /// Events to publish on both success and failure paths.
    pub publish_anyway: Vec<RaisedEvent>,
    /// Serialized saga results for the coordinator's reply endpoint.
    pub saga_results: Vec<Vec<u8>>,
}

/// Bounded in-memory collector for events raised during handling.
///
/// Three buckets:
/// - `events`: domain events, published only when the transaction commits.
/// - `publish_anyway`: events that publish regardless of the outcome
///   (critical audit/notification events).
/// - `saga_results`: values routed back to the saga coordinator.
#[derive(Debug, Default)]
pub struct ScopedEventBus {
    events: Vec<RaisedEvent>,
    publish_anyway: Vec<RaisedEvent>,
    saga_results: Vec<Vec<u8>>,
}

impl ScopedEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise a domain event, published only if handling commits.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialization`] if the event cannot be
    /// encoded.
    pub fn raise_event<E: DomainEvent>(&mut self, event: &E) -> Result<(), CodecError> {
        self.events.push(RaisedEvent::capture(event)?);
        Ok(())
    }

    /// Raise an event that publishes on both success and failure paths.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialization`] if the event cannot be
    /// encoded.
    pub fn raise_publish_anyway<E: DomainEvent>(&mut self, event: &E) -> Result<(), CodecError> {
        self.publish_anyway.push(RaisedEvent::capture(event)?);
        Ok(())
    }

    /// Record a result for the saga coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialization`] if the result cannot be
    /// encoded.
    pub fn add_saga_result<T: Serialize>(&mut self, result: &T) -> Result<(), CodecError> {
        self.saga_results.push(
            bincode::serialize(result).map_err(|e| CodecError::Serialization(e.to_string()))?,
        );
        Ok(())
    }

    /// Discard everything raised so far. Used when a retryable conflict
    /// rolls the attempt back.
    pub fn clear_messages(&mut self) {
        self.events.clear();
        self.publish_anyway.clear();
        self.saga_results.clear();
    }

    /// Events raised so far (success bucket).
    #[must_use]
    pub fn events(&self) -> &[RaisedEvent] {
        &self.events
    }

    /// Publish-anyway events raised so far.
    #[must_use]
    pub fn publish_anyway(&self) -> &[RaisedEvent] {
        &self.publish_anyway
    }

    /// Move everything out of the bus. The buckets are consumed exactly
    /// once per attempt.
    #[must_use]
    pub fn drain(&mut self) -> EventBusSnapshot {
        EventBusSnapshot {
            events: std::mem::take(&mut self.events),
            publish_anyway: std::mem::take(&mut self.publish_anyway),
            saga_results: std::mem::take(&mut self.saga_results),
        }
    }
}

/// The per-command scope handed to handlers.
///
/// Built fresh per message; carries the event bus, the reply slot, and an
/// extensions bag. Handlers receive `&mut CommandScope`, so the scope needs
/// no internal synchronization.
pub struct CommandScope {
    message_id: String,
    saga_info: Option<SagaInfo>,
    bus: ScopedEventBus,
    reply: Option<Vec<u8>>,
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl CommandScope {
    /// Build a scope for the given context.
    #[must_use]
    pub fn new(ctx: &MessageContext) -> Self {
        Self {
            message_id: ctx.message.message_id.clone(),
            saga_info: ctx.message.saga_info.clone(),
            bus: ScopedEventBus::new(),
            reply: None,
            extensions: HashMap::new(),
        }
    }

    /// Id of the command being handled.
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Saga correlation of the command being handled, if any.
    #[must_use]
    pub const fn saga_info(&self) -> Option<&SagaInfo> {
        self.saga_info.as_ref()
    }

    /// The scope's event bus.
    pub fn bus(&mut self) -> &mut ScopedEventBus {
        &mut self.bus
    }

    /// Set the value carried back in the reply envelope, if the producer
    /// requested a reply. The last call wins.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialization`] if the reply cannot be
    /// encoded.
    pub fn respond_with<T: Serialize>(&mut self, reply: &T) -> Result<(), CodecError> {
        self.reply = Some(
            bincode::serialize(reply).map_err(|e| CodecError::Serialization(e.to_string()))?,
        );
        Ok(())
    }

    /// Take the reply value set by the handler, if any.
    #[must_use]
    pub fn take_reply(&mut self) -> Option<Vec<u8>> {
        self.reply.take()
    }

    /// Drain the event bus. See [`ScopedEventBus::drain`].
    #[must_use]
    pub fn drain_bus(&mut self) -> EventBusSnapshot {
        self.bus.drain()
    }

    /// Reset the scope for a fresh handling attempt: clears the bus and the
    /// reply slot. Extensions survive so a shared unit-of-work can be
    /// reused across retries.
    pub fn reset_for_retry(&mut self) {
        self.bus.clear_messages();
        self.reply = None;
    }

    /// Store a per-command extension value, keyed by its type.
    pub fn insert_extension<T: Send + Sync + 'static>(&mut self, value: T) {
        self.extensions.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Fetch a previously stored extension.
    #[must_use]
    pub fn extension<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
    }
}

impl std::fmt::Debug for CommandScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandScope")
            .field("message_id", &self.message_id)
            .field("saga_info", &self.saga_info)
            .field("has_reply", &self.reply.is_some())
            .finish_non_exhaustive()
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

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    enum AuditEvent {
        Recorded { actor: String },
    }

    impl DomainEvent for AuditEvent {
        fn event_type(&self) -> &'static str {
            "AuditRecorded.v1"
        }

        fn topic(&self) -> &'static str {
            "audit-events"
        }

        fn key(&self) -> String {
            match self {
                AuditEvent::Recorded { actor } => actor.clone(),
            }
        }
    }

    fn scope() -> CommandScope {
        let message =
            CommandMessage::new("cmd-1", "k-1", &Noop, "tests").expect("encoding should succeed");
        let ctx = MessageContext::new(
            message,
            CommitToken {
                topic: "commands".to_string(),
                partition: 0,
                offset: 0,
            },
            "group-a",
        );
        CommandScope::new(&ctx)
    }

    #[test]
    fn buckets_collect_independently() {
        let mut scope = scope();
        let event = AuditEvent::Recorded {
            actor: "alice".to_string(),
        };

        scope.bus().raise_event(&event).expect("encode");
        scope.bus().raise_publish_anyway(&event).expect("encode");
        scope.bus().add_saga_result(&42u32).expect("encode");

        let snapshot = scope.drain_bus();
        assert_eq!(snapshot.events.len(), 1);
        assert_eq!(snapshot.publish_anyway.len(), 1);
        assert_eq!(snapshot.saga_results.len(), 1);
        assert_eq!(snapshot.events[0].topic, "audit-events");

        // Draining consumes the buckets.
        let empty = scope.drain_bus();
        assert!(empty.events.is_empty());
        assert!(empty.publish_anyway.is_empty());
    }

    #[test]
    fn clear_messages_discards_all_buckets() {
        let mut scope = scope();
        let event = AuditEvent::Recorded {
            actor: "alice".to_string(),
        };
        scope.bus().raise_event(&event).expect("encode");
        scope.bus().add_saga_result(&1u8).expect("encode");

        scope.bus().clear_messages();

        let snapshot = scope.drain_bus();
        assert!(snapshot.events.is_empty());
        assert!(snapshot.saga_results.is_empty());
    }

    #[test]
    fn reset_for_retry_clears_bus_and_reply_but_keeps_extensions() {
        let mut scope = scope();
        scope.insert_extension(7usize);
        scope.respond_with(&"ok").expect("encode");
        scope
            .bus()
            .raise_event(&AuditEvent::Recorded {
                actor: "bob".to_string(),
            })
            .expect("encode");

        scope.reset_for_retry();

        assert!(scope.take_reply().is_none());
        assert!(scope.drain_bus().events.is_empty());
        assert_eq!(scope.extension::<usize>(), Some(&7));
    }

    #[test]
    fn reply_last_write_wins() {
        let mut scope = scope();
        scope.respond_with(&1u32).expect("encode");
        scope.respond_with(&2u32).expect("encode");

        let bytes = scope.take_reply().expect("reply was set");
        let decoded: u32 = bincode::deserialize(&bytes).expect("decode");
        assert_eq!(decoded, 2);
        assert!(scope.take_reply().is_none());
    }
}

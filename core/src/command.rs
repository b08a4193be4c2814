//! Command and domain event traits.
//!
//! Commands are intents to change state and are handled by exactly one
//! handler. Domain events are facts produced by handlers and may fan out to
//! many subscribers. Both are serialized with `bincode` for compact storage
//! and fast encoding; the type name travels alongside the bytes so the
//! consumer can route payloads without reflection.
//!
//! # Type Naming Convention
//!
//! `TYPE_NAME` / `event_type()` should return a stable string identifier
//! that includes a version suffix, allowing schema evolution over time:
//!
//! - `"TransferFunds.v1"`
//! - `"FundsTransferred.v1"`
//! - `"FundsTransferred.v2"` (after a schema change)
//!
//! # Example
//!
//! ```
//! use mailroom_core::command::Command;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct TransferFunds {
//!     from: String,
//!     to: String,
//!     amount: i64,
//! }
//!
//! impl Command for TransferFunds {
//!     const TYPE_NAME: &'static str = "TransferFunds.v1";
//! }
//! ```

use crate::message::Payload;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Error types for payload encoding and decoding.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Failed to serialize a value to bytes.
    #[error("Failed to serialize: {0}")]
    Serialization(String),

    /// Failed to deserialize a value from bytes.
    #[error("Failed to deserialize: {0}")]
    Deserialization(String),

    /// The payload carries a different type than the one requested.
    #[error("Payload type mismatch: expected '{expected}', found '{actual}'")]
    TypeMismatch {
        /// The type the caller asked for.
        expected: &'static str,
        /// The type recorded in the payload.
        actual: String,
    },
}

/// An intent to change state, handled by exactly one registered handler.
///
/// The associated `TYPE_NAME` constant is the wire identifier used to route
/// an inbound payload to its handler, so it must be stable across releases
/// of producer and consumer.
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable wire identifier for this command type (e.g. `"TransferFunds.v1"`).
    const TYPE_NAME: &'static str;

    /// Encode this command into a [`Payload`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialization`] if the command cannot be
    /// serialized, which is rare with bincode.
    fn to_payload(&self) -> Result<Payload, CodecError> {
        Ok(Payload {
            type_name: Self::TYPE_NAME.to_string(),
            body: bincode::serialize(self)
                .map_err(|e| CodecError::Serialization(e.to_string()))?,
        })
    }

    /// Decode a command of this type from a [`Payload`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TypeMismatch`] if the payload carries a
    /// different type name, or [`CodecError::Deserialization`] if the body
    /// cannot be decoded.
    fn from_payload(payload: &Payload) -> Result<Self, CodecError> {
        if payload.type_name != Self::TYPE_NAME {
            return Err(CodecError::TypeMismatch {
                expected: Self::TYPE_NAME,
                actual: payload.type_name.clone(),
            });
        }
        bincode::deserialize(&payload.body)
            .map_err(|e| CodecError::Deserialization(e.to_string()))
    }
}

/// A fact raised by a command handler during handling.
///
/// Events declare the topic they publish to and the partition key that
/// orders them; the pipeline wraps raised events into outbound envelopes
/// carrying the source command id and saga correlation data.
pub trait DomainEvent: Serialize + Send + Sync + 'static {
    /// Stable wire identifier for this event (e.g. `"FundsTransferred.v1"`).
    fn event_type(&self) -> &'static str;

    /// The topic this event publishes to (e.g. `"ledger-events"`).
    fn topic(&self) -> &'static str;

    /// The partition key ordering this event, typically the aggregate id.
    fn key(&self) -> String;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialization`] if the event cannot be
    /// serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct TestCommand {
        id: String,
        value: i32,
    }

    impl Command for TestCommand {
        const TYPE_NAME: &'static str = "TestCommand.v1";
    }

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    enum LedgerEvent {
        Credited { account: String, amount: i64 },
    }

    impl DomainEvent for LedgerEvent {
        fn event_type(&self) -> &'static str {
            match self {
                LedgerEvent::Credited { .. } => "Credited.v1",
            }
        }

        fn topic(&self) -> &'static str {
            "ledger-events"
        }

        fn key(&self) -> String {
            match self {
                LedgerEvent::Credited { account, .. } => account.clone(),
            }
        }
    }

    #[test]
    #[allow(clippy::expect_used)] // Test will fail if serialization fails
    fn command_payload_roundtrip() {
        let command = TestCommand {
            id: "t-1".to_string(),
            value: 42,
        };

        let payload = command.to_payload().expect("serialization should succeed");
        assert_eq!(payload.type_name, "TestCommand.v1");

        let decoded =
            TestCommand::from_payload(&payload).expect("deserialization should succeed");
        assert_eq!(command, decoded);
    }

    #[test]
    fn from_payload_rejects_wrong_type() {
        let payload = Payload {
            type_name: "SomethingElse.v1".to_string(),
            body: vec![1, 2, 3],
        };

        let result = TestCommand::from_payload(&payload);
        assert!(matches!(result, Err(CodecError::TypeMismatch { .. })));
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn event_declares_topic_and_key() {
        let event = LedgerEvent::Credited {
            account: "acct-9".to_string(),
            amount: 10,
        };

        assert_eq!(event.event_type(), "Credited.v1");
        assert_eq!(event.topic(), "ledger-events");
        assert_eq!(event.key(), "acct-9");
        assert!(!event.to_bytes().expect("serialization should succeed").is_empty());
    }
}

//! # Mailroom Core
//!
//! Core traits and types for the Mailroom command-consumer architecture.
//!
//! Mailroom is a CQRS/event-sourcing-style command consumer: a long-running
//! worker that pulls command messages from a durable queue, dispatches each
//! to its registered handler, atomically persists the resulting domain
//! events together with a record of the command having been handled, and
//! publishes those events (plus any replies) back to the queue. Exactly-once
//! effective processing is achieved by local idempotency plus at-least-once
//! redelivery — no distributed consensus.
//!
//! This crate defines the data model and the adapter contracts; the moving
//! parts live in `mailroom-runtime`.
//!
//! ## Core Concepts
//!
//! - **Command**: an intent to change state, handled by exactly one handler
//! - **Routing key**: the identifier along which related commands are
//!   serialized (usually an aggregate id)
//! - **Handled-command record**: idempotency marker; its presence means the
//!   command's effects are durable
//! - **Outbox**: durable table of envelopes awaiting transport publication
//! - **Scope**: per-command container holding the event bus, reply slot,
//!   and extensions — no ambient/global state
//!
//! ## Guarantees
//!
//! - A handled-command record exists iff all emitted envelopes are durably
//!   in the outbox (single-transaction write).
//! - A queue offset is committed only after the above holds, or the
//!   message was a duplicate / had no handler.
//! - Commands sharing a routing key are handled strictly in delivery order.
//!
//! ## Example
//!
//! ```ignore
//! use mailroom_core::prelude::*;
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct TransferFunds { from: String, to: String, amount: i64 }
//!
//! impl Command for TransferFunds {
//!     const TYPE_NAME: &'static str = "TransferFunds.v1";
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register::<TransferFunds, _>(TransferHandler::new(ledger));
//! ```

pub mod command;
pub mod envelope;
pub mod handler;
pub mod message;
pub mod queue;
pub mod scope;
pub mod store;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

/// Convenience re-exports for downstream crates.
pub mod prelude {
    pub use crate::command::{CodecError, Command, DomainEvent};
    pub use crate::envelope::{
        EnvelopeKind, EventEnvelope, OutboundEnvelope, ReplyBody, ReplyEnvelope,
    };
    pub use crate::handler::{CommandHandler, HandlerError, HandlerFuture, HandlerRegistry};
    pub use crate::message::{CommandMessage, CommitToken, MessageContext, Payload, SagaInfo};
    pub use crate::queue::{CommandStream, QueueClient, QueueError};
    pub use crate::scope::{CommandScope, ScopedEventBus};
    pub use crate::store::{MessageStore, StoreError};
}

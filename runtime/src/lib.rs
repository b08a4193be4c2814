//! # Mailroom Runtime
//!
//! Runtime implementation for the Mailroom command-consumer architecture:
//! the mailbox scheduler, the command pipeline, and the consumer
//! orchestrator.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐
//! │ Queue client│ (rdkafka / in-memory)
//! └──────┬──────┘
//!        │ contexts
//!        ▼
//! ┌─────────────────┐    backpressure
//! │ CommandConsumer │◄── LoadGate (full_load_threshold / low_water)
//! └────────┬────────┘
//!          │ per routing key
//!          ▼
//! ┌─────────────────┐
//! │MailboxScheduler │  serial per key, parallel across keys
//! └────────┬────────┘
//!          │ one at a time per key
//!          ▼
//! ┌─────────────────┐
//! │CommandProcessor │  probe → handle → save (tx) → publish → commit
//! └────┬───────┬────┘
//!      ▼       ▼
//! ┌────────┐ ┌──────────┐
//! │ Message│ │  Queue   │
//! │  store │ │ publish  │
//! └────────┘ └──────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Per-key FIFO: handler-completion order equals delivery order for
//!   contexts sharing a routing key.
//! - Exactly-once effective processing: the idempotency probe plus the
//!   single-transaction handled-record/outbox write absorb redeliveries.
//! - Bounded memory: in-flight contexts never exceed the configured
//!   threshold, with hysteresis on resume.
//! - Exception safety: handler errors and panics are absorbed at the
//!   pipeline and scheduler boundaries; a failing drain task can never
//!   wedge its mailbox.

pub mod backpressure;
pub mod config;
pub mod consumer;
pub mod mailbox;
pub mod metrics;
pub mod pipeline;
pub mod retry;

pub use backpressure::{LoadGate, LoadPermit};
pub use config::ConsumerConfig;
pub use consumer::{CommandConsumer, ConsumerError};
pub use mailbox::MailboxScheduler;
pub use pipeline::CommandProcessor;
pub use retry::RetryPolicy;

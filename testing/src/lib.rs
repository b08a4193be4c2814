//! # Mailroom Testing
//!
//! Testing utilities and in-memory adapters for the Mailroom architecture.
//!
//! This crate provides:
//! - [`InMemoryQueueClient`]: FIFO queue recording publishes and commits
//! - [`InMemoryMessageStore`]: hashmap-backed store with failure injection
//! - [`builders`]: shorthand constructors for messages and contexts
//!
//! ## Example
//!
//! ```ignore
//! use mailroom_testing::{InMemoryQueueClient, InMemoryMessageStore};
//!
//! #[tokio::test]
//! async fn handles_transfer() {
//!     let queue = InMemoryQueueClient::new();
//!     let store = InMemoryMessageStore::new();
//!     let (mut consumer, shutdown) = CommandConsumer::new(
//!         Arc::new(queue.clone()),
//!         Arc::new(store.clone()),
//!         registry,
//!         config,
//!     );
//!
//!     queue.push(transfer_command());
//!     // ... run, assert on store.outbox() and queue.committed() ...
//! }
//! ```

pub mod queue;
pub mod store;

pub use queue::InMemoryQueueClient;
pub use store::{FailedRecord, HandledRecord, InMemoryMessageStore};

/// Shorthand constructors for test messages and contexts.
pub mod builders {
    use mailroom_core::command::Command;
    use mailroom_core::message::{CommandMessage, CommitToken, MessageContext};

    /// Build a command message with the given ids.
    ///
    /// # Panics
    ///
    /// Panics if the command cannot be encoded, which indicates a broken
    /// test fixture.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn command_message<C: Command>(
        message_id: &str,
        routing_key: &str,
        command: &C,
    ) -> CommandMessage {
        CommandMessage::new(message_id, routing_key, command, "mailroom-tests")
            .expect("test command should encode")
    }

    /// Build a delivered context for a message, with a fixed token.
    #[must_use]
    pub fn context(message: CommandMessage, offset: i64, consumer_group: &str) -> MessageContext {
        MessageContext::new(
            message,
            CommitToken {
                topic: "commands".to_string(),
                partition: 0,
                offset,
            },
            consumer_group,
        )
    }
}

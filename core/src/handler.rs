//! Command handlers and the handler registry.
//!
//! A handler is registered once per command type. At registration the
//! handler is erased into an invoker of signature
//! `(&mut CommandScope, &Payload) → future<Result<(), HandlerError>>`, so
//! the pipeline dispatches without knowing concrete command types.
//! Synchronous handlers are wrapped into async invokers once, at
//! registration, not per dispatch.
//!
//! Resolution is deterministic: when the same command type is registered
//! twice, the first registration wins and the later one is ignored with a
//! warning.

use crate::command::Command;
use crate::message::Payload;
use crate::scope::CommandScope;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors a command handler can produce.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// A business rule rejected the command. Logged at `warn`.
    #[error("domain rule violated: {0}")]
    Domain(String),

    /// A write raced a concurrent writer on the same aggregate. Retried
    /// when the command carries `need_retry`.
    #[error("optimistic concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// The handler exceeded the configured per-command timeout. Never
    /// retried.
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    /// Any other failure. Logged at `error`.
    #[error("{0}")]
    System(String),
}

impl HandlerError {
    /// Short classification used in failure records and reply envelopes.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Domain(_) => "Domain",
            Self::ConcurrencyConflict(_) => "ConcurrencyConflict",
            Self::Timeout(_) => "Timeout",
            Self::System(_) => "System",
        }
    }

    /// Whether this is a domain-level failure (business rule violation or
    /// an unretried concurrency conflict), as opposed to a system failure.
    #[must_use]
    pub const fn is_domain(&self) -> bool {
        matches!(self, Self::Domain(_) | Self::ConcurrencyConflict(_))
    }

    /// Whether this is an optimistic-concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }
}

impl From<crate::store::StoreError> for HandlerError {
    fn from(err: crate::store::StoreError) -> Self {
        match err {
            crate::store::StoreError::ConcurrencyConflict(reason) => {
                Self::ConcurrencyConflict(reason)
            },
            other => Self::System(other.to_string()),
        }
    }
}

/// Future returned by handler invocations.
pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// An async command handler.
///
/// Handlers receive the per-command [`CommandScope`] (event bus, reply
/// slot, extensions) and the decoded command. All I/O goes through
/// dependencies the handler owns or finds in the scope's extensions; there
/// is no ambient state.
///
/// # Dyn Compatibility
///
/// The trait returns `Pin<Box<dyn Future>>` rather than using `async fn`
/// so handlers can be erased and stored in the registry.
///
/// # Example
///
/// ```
/// use mailroom_core::command::Command;
/// use mailroom_core::handler::{CommandHandler, HandlerError, HandlerFuture};
/// use mailroom_core::scope::CommandScope;
/// use serde::{Serialize, Deserialize};
///
/// #[derive(Clone, Debug, Serialize, Deserialize)]
/// struct TransferFunds { from: String, to: String, amount: i64 }
///
/// impl Command for TransferFunds {
///     const TYPE_NAME: &'static str = "TransferFunds.v1";
/// }
///
/// struct TransferHandler;
///
/// impl CommandHandler<TransferFunds> for TransferHandler {
///     fn handle<'a>(
///         &'a self,
///         scope: &'a mut CommandScope,
///         command: TransferFunds,
///     ) -> HandlerFuture<'a> {
///         Box::pin(async move {
///             if command.amount <= 0 {
///                 return Err(HandlerError::Domain("amount must be positive".into()));
///             }
///             // ... mutate aggregates, raise events via scope.bus() ...
///             Ok(())
///         })
///     }
/// }
/// ```
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    /// Handle the command within the given scope.
    fn handle<'a>(&'a self, scope: &'a mut CommandScope, command: C) -> HandlerFuture<'a>;
}

/// Type-erased handler invoker stored in the registry.
pub type HandlerInvoker =
    Arc<dyn for<'a> Fn(&'a mut CommandScope, &'a Payload) -> HandlerFuture<'a> + Send + Sync>;

/// Registry mapping command type names to handler invokers.
///
/// Lookup is an exact match on the payload's `type_name`. Registration
/// order is preserved; the first registration for a type wins.
#[derive(Default)]
pub struct HandlerRegistry {
    invokers: HashMap<String, HandlerInvoker>,
    order: Vec<String>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler for `C`.
    ///
    /// If a handler for `C` is already registered, the first registration
    /// wins and this call logs a warning.
    pub fn register<C, H>(&mut self, handler: H) -> &mut Self
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let handler = Arc::new(handler);
        let invoker: HandlerInvoker =
            Arc::new(move |scope: &mut CommandScope, payload: &Payload| {
                let handler = Arc::clone(&handler);
                let decoded = C::from_payload(payload);
                Box::pin(async move {
                    let command = decoded
                        .map_err(|e| HandlerError::System(format!("malformed payload: {e}")))?;
                    handler.handle(scope, command).await
                })
            });
        self.insert(C::TYPE_NAME, invoker);
        self
    }

    /// Register a synchronous handler for `C`, wrapped into an async
    /// invoker once at registration.
    ///
    /// Use this for handlers that do no I/O of their own; the function runs
    /// inline on the mailbox drain task.
    pub fn register_sync<C, F>(&mut self, handler: F) -> &mut Self
    where
        C: Command,
        F: Fn(&mut CommandScope, C) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let invoker: HandlerInvoker =
            Arc::new(move |scope: &mut CommandScope, payload: &Payload| {
                let handler = Arc::clone(&handler);
                let decoded = C::from_payload(payload);
                Box::pin(async move {
                    let command = decoded
                        .map_err(|e| HandlerError::System(format!("malformed payload: {e}")))?;
                    handler(scope, command)
                })
            });
        self.insert(C::TYPE_NAME, invoker);
        self
    }

    fn insert(&mut self, type_name: &'static str, invoker: HandlerInvoker) {
        if self.invokers.contains_key(type_name) {
            tracing::warn!(
                command_type = type_name,
                "Handler already registered for command type, first registration wins"
            );
            return;
        }
        self.invokers.insert(type_name.to_string(), invoker);
        self.order.push(type_name.to_string());
    }

    /// Resolve the invoker for a command type name.
    #[must_use]
    pub fn resolve(&self, type_name: &str) -> Option<HandlerInvoker> {
        self.invokers.get(type_name).map(Arc::clone)
    }

    /// Number of registered command types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.invokers.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }

    /// Registered command type names, in registration order.
    #[must_use]
    pub fn registered_types(&self) -> &[String] {
        &self.order
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered", &self.order)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::message::{CommandMessage, CommitToken, MessageContext};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Increment {
        by: i64,
    }

    impl Command for Increment {
        const TYPE_NAME: &'static str = "Increment.v1";
    }

    struct RespondingHandler;

    impl CommandHandler<Increment> for RespondingHandler {
        fn handle<'a>(
            &'a self,
            scope: &'a mut CommandScope,
            command: Increment,
        ) -> HandlerFuture<'a> {
            Box::pin(async move {
                scope
                    .respond_with(&command.by)
                    .map_err(|e| HandlerError::System(e.to_string()))?;
                Ok(())
            })
        }
    }

    fn scope_for(command: &Increment) -> (CommandScope, Payload) {
        let message = CommandMessage::new("m-1", "k-1", command, "tests")
            .expect("encoding should succeed");
        let payload = message.payload.clone();
        let ctx = MessageContext::new(
            message,
            CommitToken {
                topic: "commands".to_string(),
                partition: 0,
                offset: 0,
            },
            "group-a",
        );
        (CommandScope::new(&ctx), payload)
    }

    #[tokio::test]
    async fn registered_handler_is_invoked_with_decoded_command() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Increment, _>(RespondingHandler);

        let invoker = registry.resolve("Increment.v1").expect("registered");
        let (mut scope, payload) = scope_for(&Increment { by: 5 });

        invoker(&mut scope, &payload).await.expect("handler succeeds");

        let reply = scope.take_reply().expect("handler set a reply");
        let decoded: i64 = bincode::deserialize(&reply).expect("decode");
        assert_eq!(decoded, 5);
    }

    #[tokio::test]
    async fn sync_handler_wrapped_at_registration() {
        let mut registry = HandlerRegistry::new();
        registry.register_sync::<Increment, _>(|scope, command: Increment| {
            scope
                .respond_with(&(command.by * 2))
                .map_err(|e| HandlerError::System(e.to_string()))
        });

        let invoker = registry.resolve("Increment.v1").expect("registered");
        let (mut scope, payload) = scope_for(&Increment { by: 4 });
        invoker(&mut scope, &payload).await.expect("handler succeeds");

        let reply = scope.take_reply().expect("handler set a reply");
        let decoded: i64 = bincode::deserialize(&reply).expect("decode");
        assert_eq!(decoded, 8);
    }

    #[tokio::test]
    async fn first_registration_wins() {
        let mut registry = HandlerRegistry::new();
        registry.register_sync::<Increment, _>(|scope, _command| {
            scope
                .respond_with(&"first")
                .map_err(|e| HandlerError::System(e.to_string()))
        });
        registry.register_sync::<Increment, _>(|scope, _command| {
            scope
                .respond_with(&"second")
                .map_err(|e| HandlerError::System(e.to_string()))
        });

        assert_eq!(registry.len(), 1);

        let invoker = registry.resolve("Increment.v1").expect("registered");
        let (mut scope, payload) = scope_for(&Increment { by: 1 });
        invoker(&mut scope, &payload).await.expect("handler succeeds");

        let reply = scope.take_reply().expect("reply set");
        let decoded: String = bincode::deserialize(&reply).expect("decode");
        assert_eq!(decoded, "first");
    }

    #[test]
    fn resolve_unknown_type_returns_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.resolve("Unknown.v1").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn malformed_payload_surfaces_as_system_error() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Increment, _>(RespondingHandler);

        let invoker = registry.resolve("Increment.v1").expect("registered");
        let (mut scope, _) = scope_for(&Increment { by: 1 });
        let bogus = Payload {
            type_name: "Increment.v1".to_string(),
            body: vec![0xFF],
        };

        let err = invoker(&mut scope, &bogus)
            .await
            .expect_err("malformed payload must fail");
        assert_eq!(err.error_type(), "System");
    }
}

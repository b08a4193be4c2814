//! The command pipeline: one message in, durable effects out.
//!
//! For every inbound context the processor runs the same sequence:
//!
//! 1. Type gate — payloads without a type name are poison, not fatal.
//! 2. Idempotency probe — already-handled commands produce only a
//!    `DuplicatelyHandled` reply.
//! 3. Handler resolution — unresolvable commands produce only a
//!    `NoHandlerExists` reply.
//! 4. Handler execution in a fresh [`CommandScope`], optionally bounded by
//!    the per-command timeout.
//! 5. Envelope collection, in order: reply, raised events, publish-anyway
//!    events, saga results.
//! 6. Atomic persistence: handled-command record + outbox rows in one
//!    store transaction.
//! 7. On failure: rollback, failure reply, publish-anyway and saga results
//!    re-collected, failure recorded in a separate transaction. Optimistic
//!    concurrency conflicts retry with backoff when the command allows it.
//! 8. Best-effort publish of the collected envelopes; failures are logged
//!    and left to the outbox relay.
//! 9. Offset commit. The consumer never holds the offset hostage to
//!    transport health: the outbox is the source of truth.
//!
//! An infrastructure failure before the outcome is durable (probe or
//! failure-record write) leaves the offset uncommitted so the queue
//! redelivers the message.

use crate::config::ConsumerConfig;
use crate::retry::RetryPolicy;
use mailroom_core::envelope::{OutboundEnvelope, ReplyBody};
use mailroom_core::handler::{HandlerError, HandlerInvoker, HandlerRegistry};
use mailroom_core::message::MessageContext;
use mailroom_core::queue::QueueClient;
use mailroom_core::scope::{CommandScope, EventBusSnapshot};
use mailroom_core::store::{MessageStore, StoreError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Executes the consume pipeline for delivered command contexts.
///
/// One processor is shared by all mailbox drain tasks; per-command state
/// lives in the [`CommandScope`] built for each invocation.
pub struct CommandProcessor {
    store: Arc<dyn MessageStore>,
    queue: Arc<dyn QueueClient>,
    registry: Arc<HandlerRegistry>,
    retry: RetryPolicy,
    handler_timeout: Option<Duration>,
    producer: String,
}

/// Why the pipeline could not reach a durable outcome for a context.
///
/// These are infrastructure failures, distinct from handler failures: the
/// offset stays uncommitted and the queue will redeliver.
#[derive(Debug, thiserror::Error)]
enum PipelineStall {
    #[error("idempotency probe failed: {0}")]
    Probe(StoreError),
    #[error("failure record write failed: {0}")]
    FailureRecord(StoreError),
}

impl CommandProcessor {
    /// Create a processor wired to the given adapters.
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        queue: Arc<dyn QueueClient>,
        registry: Arc<HandlerRegistry>,
        config: &ConsumerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            retry: config.retry.clone(),
            handler_timeout: config.handler_timeout,
            producer: config.consumer_group.clone(),
        }
    }

    /// Consume one context to completion. Never returns an error: every
    /// outcome is either durable (offset committed) or intentionally left
    /// for redelivery (offset uncommitted, logged).
    pub async fn consume(&self, ctx: MessageContext) {
        match self.consume_inner(&ctx).await {
            Ok(envelopes) => {
                self.publish_envelopes(&envelopes).await;
                if let Err(e) = self.queue.commit(&ctx.token).await {
                    tracing::error!(
                        message_id = ctx.message_id(),
                        token = %ctx.token,
                        error = %e,
                        "Offset commit failed, message may be redelivered"
                    );
                }
            },
            Err(stall) => {
                tracing::error!(
                    message_id = ctx.message_id(),
                    token = %ctx.token,
                    error = %stall,
                    "Pipeline stalled before a durable outcome, leaving offset uncommitted"
                );
            },
        }
    }

    async fn consume_inner(
        &self,
        ctx: &MessageContext,
    ) -> Result<Vec<OutboundEnvelope>, PipelineStall> {
        // 1. Type gate: a record without a command type is poison but not
        // fatal; ack it so it does not wedge the partition.
        if ctx.message.payload.type_name.is_empty() {
            tracing::warn!(
                message_id = ctx.message_id(),
                "Message payload has no command type, treating as poison"
            );
            return Ok(Vec::new());
        }

        // 2. Idempotency probe.
        let handled = self
            .store
            .has_command_handled(ctx.message_id(), &ctx.consumer_group)
            .await
            .map_err(PipelineStall::Probe)?;
        if handled {
            tracing::debug!(
                message_id = ctx.message_id(),
                "Command already handled, replying duplicate"
            );
            return Ok(self.reply_only(ctx, ReplyBody::DuplicatelyHandled));
        }

        // 3. Resolve the handler.
        let Some(invoker) = self.registry.resolve(&ctx.message.payload.type_name) else {
            tracing::warn!(
                message_id = ctx.message_id(),
                command_type = %ctx.message.payload.type_name,
                "No handler registered for command type"
            );
            return Ok(self.reply_only(ctx, ReplyBody::NoHandlerExists));
        };

        // 4-7. Execute with conflict retry.
        self.execute_with_retry(ctx, &invoker).await
    }

    /// Steps 4-7: run the handler, persist, retry on retryable conflicts.
    async fn execute_with_retry(
        &self,
        ctx: &MessageContext,
        invoker: &HandlerInvoker,
    ) -> Result<Vec<OutboundEnvelope>, PipelineStall> {
        let mut scope = CommandScope::new(ctx);
        let mut attempt: u32 = 0;

        loop {
            scope.reset_for_retry();

            let outcome = self.invoke_handler(ctx, invoker, &mut scope).await;
            let reply = scope.take_reply();
            let snapshot = scope.drain_bus();

            let error = match outcome {
                Ok(()) => {
                    let envelopes = self.build_envelopes(
                        ctx,
                        ctx.reply_requested()
                            .then(|| ReplyBody::Handled(reply.unwrap_or_default())),
                        &snapshot,
                        true,
                    );
                    match self.store.save_command(ctx, &envelopes).await {
                        Ok(()) => return Ok(envelopes),
                        Err(StoreError::DuplicateCommand { .. }) => {
                            // Another consumer won the race between the
                            // probe and the save; the command is handled.
                            tracing::debug!(
                                message_id = ctx.message_id(),
                                "Lost idempotency race, treating as duplicate"
                            );
                            return Ok(self.reply_only(ctx, ReplyBody::DuplicatelyHandled));
                        },
                        Err(e) => HandlerError::from(e),
                    }
                },
                Err(e) => e,
            };

            if error.is_conflict() && ctx.message.need_retry {
                if self.retry.should_retry(attempt) {
                    let delay = self.retry.delay_for_attempt(attempt);
                    attempt += 1;
                    metrics::counter!("optimistic_concurrency_retries_total").increment(1);
                    tracing::warn!(
                        message_id = ctx.message_id(),
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Concurrency conflict, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                // Cap exhausted: reclassify as a system failure.
                let exhausted = HandlerError::System(format!(
                    "concurrency conflict persisted after {attempt} retries: {error}"
                ));
                return self.handle_failure(ctx, &snapshot, &exhausted).await;
            }

            return self.handle_failure(ctx, &snapshot, &error).await;
        }
    }

    async fn invoke_handler(
        &self,
        ctx: &MessageContext,
        invoker: &HandlerInvoker,
        scope: &mut CommandScope,
    ) -> Result<(), HandlerError> {
        let start = Instant::now();
        let result = match self.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, invoker(scope, &ctx.message.payload))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(HandlerError::Timeout(limit)),
            },
            None => invoker(scope, &ctx.message.payload).await,
        };
        metrics::histogram!("handler_duration_seconds").record(start.elapsed().as_secs_f64());
        result
    }

    /// Steps 5/7 envelope assembly, in collection order: reply, events
    /// (success only), publish-anyway events, saga results.
    fn build_envelopes(
        &self,
        ctx: &MessageContext,
        reply_body: Option<ReplyBody>,
        snapshot: &EventBusSnapshot,
        include_events: bool,
    ) -> Vec<OutboundEnvelope> {
        let mut envelopes = Vec::new();
        if let Some(body) = reply_body {
            envelopes.extend(OutboundEnvelope::wrap_reply(ctx, body, &self.producer));
        }
        if include_events {
            for raised in &snapshot.events {
                envelopes.push(OutboundEnvelope::wrap_event(ctx, raised.clone(), &self.producer));
            }
        }
        for raised in &snapshot.publish_anyway {
            envelopes.push(OutboundEnvelope::wrap_event(ctx, raised.clone(), &self.producer));
        }
        for result in &snapshot.saga_results {
            envelopes.extend(OutboundEnvelope::wrap_saga_result(
                ctx,
                result.clone(),
                &self.producer,
            ));
        }
        envelopes
    }

    /// Step 7: rollback, failure reply, publish-anyway + saga results,
    /// failure record.
    async fn handle_failure(
        &self,
        ctx: &MessageContext,
        snapshot: &EventBusSnapshot,
        error: &HandlerError,
    ) -> Result<Vec<OutboundEnvelope>, PipelineStall> {
        if let Err(e) = self.store.rollback().await {
            tracing::error!(
                message_id = ctx.message_id(),
                error = %e,
                "Message store rollback failed"
            );
        }

        // Success events are discarded; publish-anyway and saga results
        // survive failure.
        let envelopes = self.build_envelopes(
            ctx,
            ctx.reply_requested().then(|| ReplyBody::Failure {
                error_type: error.error_type().to_string(),
                message: error.to_string(),
            }),
            snapshot,
            false,
        );

        if error.is_domain() {
            metrics::counter!("handler_failures_total", "kind" => "domain").increment(1);
            tracing::warn!(
                message_id = ctx.message_id(),
                command_type = %ctx.message.payload.type_name,
                error = %error,
                "Command failed with domain error"
            );
        } else {
            metrics::counter!("handler_failures_total", "kind" => "system").increment(1);
            tracing::error!(
                message_id = ctx.message_id(),
                command_type = %ctx.message.payload.type_name,
                error = %error,
                "Command failed with system error"
            );
        }

        self.store
            .save_failed_command(ctx, error.error_type(), &error.to_string(), &envelopes)
            .await
            .map_err(PipelineStall::FailureRecord)?;

        Ok(envelopes)
    }

    fn reply_only(&self, ctx: &MessageContext, body: ReplyBody) -> Vec<OutboundEnvelope> {
        OutboundEnvelope::wrap_reply(ctx, body, &self.producer)
            .into_iter()
            .collect()
    }

    /// Step 8: hand every envelope to the transport. Successes are marked
    /// dispatched so the relay replays only the failures.
    async fn publish_envelopes(&self, envelopes: &[OutboundEnvelope]) {
        if envelopes.is_empty() {
            return;
        }

        let mut dispatched = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            match self.queue.publish(envelope).await {
                Ok(()) => dispatched.push(envelope.envelope_id),
                Err(e) => {
                    metrics::counter!("outbox_publish_errors_total").increment(1);
                    tracing::error!(
                        envelope_id = %envelope.envelope_id,
                        destination = envelope.destination(),
                        error = %e,
                        "Publish failed, outbox relay will retry"
                    );
                },
            }
        }
        metrics::counter!("outbox_envelopes_published_total")
            .increment(dispatched.len() as u64);

        if !dispatched.is_empty() {
            if let Err(e) = self.store.mark_dispatched(&dispatched).await {
                tracing::warn!(
                    error = %e,
                    "Failed to mark envelopes dispatched, relay may republish"
                );
            }
        }
    }
}

impl std::fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("producer", &self.producer)
            .field("handler_timeout", &self.handler_timeout)
            .finish_non_exhaustive()
    }
}

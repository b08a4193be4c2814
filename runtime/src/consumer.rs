//! Consumer orchestrator: queue ingress, backpressure, lifecycle.
//!
//! The orchestrator owns the subscription to the command queue and feeds
//! delivered contexts into the mailbox scheduler with the command pipeline
//! as the drain function. Every dependency is passed in at construction —
//! there is no global container.
//!
//! # Lifecycle
//!
//! [`CommandConsumer::new`] returns the consumer and a shutdown sender.
//! `run` subscribes and processes until the shutdown signal or the end of
//! the stream, then waits up to `shutdown_deadline` for in-flight mailboxes
//! to drain. Contexts still pending after the deadline are not
//! offset-committed and will be redelivered.
//!
//! # Backpressure
//!
//! One [`LoadGate`] permit is acquired per message *before* it is handed to
//! the scheduler. While the gate is saturated the consumer stops polling
//! the stream, which pauses the underlying transport; the permit travels
//! with the message and frees capacity when the pipeline finishes.

use crate::backpressure::{LoadGate, LoadPermit};
use crate::config::ConsumerConfig;
use crate::mailbox::{DrainFn, MailboxScheduler};
use crate::pipeline::CommandProcessor;
use mailroom_core::handler::HandlerRegistry;
use mailroom_core::message::MessageContext;
use mailroom_core::queue::{QueueClient, QueueError};
use mailroom_core::store::MessageStore;
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Errors that stop the consumer.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// The queue adapter failed beyond its own recovery policy.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

type Job = (MessageContext, LoadPermit);

/// The long-running command consumer.
///
/// # Example
///
/// ```ignore
/// let (mut consumer, shutdown) = CommandConsumer::new(queue, store, registry, config);
///
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     shutdown.send(true).ok();
/// });
///
/// consumer.run().await?;
/// ```
pub struct CommandConsumer {
    queue: Arc<dyn QueueClient>,
    scheduler: MailboxScheduler<Job>,
    gate: Arc<LoadGate>,
    config: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
}

impl CommandConsumer {
    /// Wire up a consumer from its collaborators.
    ///
    /// Returns the consumer and a shutdown sender; send `true` to stop it.
    #[must_use]
    pub fn new(
        queue: Arc<dyn QueueClient>,
        store: Arc<dyn MessageStore>,
        registry: HandlerRegistry,
        config: ConsumerConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let processor = Arc::new(CommandProcessor::new(
            store,
            Arc::clone(&queue),
            Arc::new(registry),
            &config,
        ));

        let drain: DrainFn<Job> = Arc::new(move |(ctx, permit): Job| {
            let processor = Arc::clone(&processor);
            Box::pin(async move {
                processor.consume(ctx).await;
                // Capacity frees only once the pipeline (including the
                // offset commit) is done with the message.
                drop(permit);
            })
        });

        let consumer = Self {
            queue,
            scheduler: MailboxScheduler::new(config.mailbox_batch_count, drain),
            gate: Arc::new(LoadGate::new(config.full_load_threshold, config.low_water)),
            config,
            shutdown: shutdown_rx,
        };

        (consumer, shutdown_tx)
    }

    /// Subscribe and consume until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Queue`] if the subscription cannot be
    /// established or the transport fails fatally.
    pub async fn run(&mut self) -> Result<(), ConsumerError> {
        tracing::info!(
            queue = %self.config.command_queue,
            consumer_group = %self.config.consumer_group,
            full_load_threshold = self.config.full_load_threshold,
            mailbox_batch_count = self.config.mailbox_batch_count,
            "Starting command consumer"
        );

        let mut stream = self
            .queue
            .subscribe(&self.config.command_queue, &self.config.consumer_group)
            .await?;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // Admission first: while saturated we stop polling the stream,
            // which is the backpressure signal to the transport.
            let permit = tokio::select! {
                permit = self.gate.acquire() => permit,
                _ = self.shutdown.changed() => continue,
            };

            let delivery = tokio::select! {
                delivery = stream.next() => delivery,
                _ = self.shutdown.changed() => {
                    drop(permit);
                    continue;
                },
            };

            match delivery {
                Some(Ok(ctx)) => {
                    metrics::counter!("messages_consumed_total").increment(1);
                    tracing::debug!(
                        message_id = ctx.message_id(),
                        key = ctx.ordering_key(),
                        token = %ctx.token,
                        "Message received"
                    );
                    self.scheduler
                        .process(ctx.ordering_key().to_string(), (ctx, permit));
                },
                Some(Err(e)) => {
                    drop(permit);
                    match e {
                        QueueError::ConnectionFailed(_) => {
                            tracing::error!(error = %e, "Queue connection lost, stopping consumer");
                            return Err(ConsumerError::Queue(e));
                        },
                        other => {
                            // Transient: the adapter reconnects; skip the
                            // record and keep reading.
                            tracing::error!(error = %other, "Error receiving from queue");
                        },
                    }
                },
                None => {
                    tracing::info!("Command stream ended");
                    break;
                },
            }
        }

        drop(stream);
        tracing::info!("Draining in-flight mailboxes");
        let drained = self.scheduler.shutdown(self.config.shutdown_deadline).await;
        tracing::info!(drained, "Command consumer stopped");
        Ok(())
    }

    /// Number of messages enqueued or executing.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.scheduler.in_flight()
    }

    /// Number of live mailboxes.
    #[must_use]
    pub fn active_mailboxes(&self) -> usize {
        self.scheduler.active_mailboxes()
    }
}

impl std::fmt::Debug for CommandConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandConsumer")
            .field("queue", &self.config.command_queue)
            .field("consumer_group", &self.config.consumer_group)
            .finish_non_exhaustive()
    }
}

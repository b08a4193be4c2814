//! In-memory queue client for tests.
//!
//! Delivers pushed command messages in FIFO order on a single partition,
//! which trivially satisfies the adapter ordering contract (same
//! routing key in producer order). Publishes and commits are recorded for
//! assertions, and publish failures can be injected per destination.

use mailroom_core::envelope::OutboundEnvelope;
use mailroom_core::message::{CommandMessage, CommitToken, MessageContext};
use mailroom_core::queue::{CommandStream, QueueClient, QueueError};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Default)]
struct QueueState {
    queue_name: String,
    next_offset: i64,
    buffered: VecDeque<(CommandMessage, CommitToken)>,
    subscriber: Option<(String, mpsc::UnboundedSender<MessageContext>)>,
    tokens_by_message: HashMap<String, CommitToken>,
    committed: BTreeSet<CommitToken>,
    published: Vec<OutboundEnvelope>,
    failing_destinations: HashSet<String>,
}

/// In-memory [`QueueClient`] recording publishes and commits.
///
/// Clone freely; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryQueueClient {
    state: Arc<Mutex<QueueState>>,
}

impl InMemoryQueueClient {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a command message for delivery. Offsets are assigned in
    /// push order on partition 0.
    pub fn push(&self, message: CommandMessage) {
        let mut state = self.lock();
        let topic = if state.queue_name.is_empty() {
            "commands".to_string()
        } else {
            state.queue_name.clone()
        };
        let token = CommitToken {
            topic,
            partition: 0,
            offset: state.next_offset,
        };
        state.next_offset += 1;
        state
            .tokens_by_message
            .insert(message.message_id.clone(), token.clone());

        if let Some((group, tx)) = &state.subscriber {
            let ctx = MessageContext::new(message, token, group.clone());
            // A dropped receiver just means the consumer stopped.
            let _ = tx.send(ctx);
        } else {
            state.buffered.push_back((message, token));
        }
    }

    /// Make publishes to `destination` fail until cleared.
    pub fn fail_publishes_to(&self, destination: impl Into<String>) {
        self.lock().failing_destinations.insert(destination.into());
    }

    /// Clear injected publish failures.
    pub fn clear_publish_failures(&self) {
        self.lock().failing_destinations.clear();
    }

    /// All envelopes published so far, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<OutboundEnvelope> {
        self.lock().published.clone()
    }

    /// Envelopes published to the given destination.
    #[must_use]
    pub fn published_to(&self, destination: &str) -> Vec<OutboundEnvelope> {
        self.lock()
            .published
            .iter()
            .filter(|e| e.destination() == destination)
            .cloned()
            .collect()
    }

    /// All committed tokens, ordered.
    #[must_use]
    pub fn committed(&self) -> Vec<CommitToken> {
        self.lock().committed.iter().cloned().collect()
    }

    /// Whether the delivery of `message_id` has been committed.
    #[must_use]
    pub fn is_committed(&self, message_id: &str) -> bool {
        let state = self.lock();
        state
            .tokens_by_message
            .get(message_id)
            .is_some_and(|token| state.committed.contains(token))
    }
}

impl QueueClient for InMemoryQueueClient {
    fn subscribe(
        &self,
        queue: &str,
        consumer_group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<CommandStream, QueueError>> + Send + '_>> {
        let queue = queue.to_string();
        let consumer_group = consumer_group.to_string();
        Box::pin(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            {
                let mut state = self.lock();
                state.queue_name = queue;
                // Re-token buffered messages under the subscribed queue name.
                let buffered: Vec<_> = state.buffered.drain(..).collect();
                for (message, mut token) in buffered {
                    token.topic = state.queue_name.clone();
                    state
                        .tokens_by_message
                        .insert(message.message_id.clone(), token.clone());
                    let ctx = MessageContext::new(message, token, consumer_group.clone());
                    let _ = tx.send(ctx);
                }
                state.subscriber = Some((consumer_group, tx));
            }

            let stream = async_stream::stream! {
                while let Some(ctx) = rx.recv().await {
                    yield Ok(ctx);
                }
            };
            Ok(Box::pin(stream) as CommandStream)
        })
    }

    fn commit(
        &self,
        token: &CommitToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let token = token.clone();
        Box::pin(async move {
            self.lock().committed.insert(token);
            Ok(())
        })
    }

    fn publish(
        &self,
        envelope: &OutboundEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let envelope = envelope.clone();
        Box::pin(async move {
            let mut state = self.lock();
            let destination = envelope.destination().to_string();
            if state.failing_destinations.contains(&destination) {
                return Err(QueueError::PublishFailed {
                    destination,
                    reason: "injected failure".to_string(),
                });
            }
            state.published.push(envelope);
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use mailroom_core::command::Command;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Ping;

    impl Command for Ping {
        const TYPE_NAME: &'static str = "Ping.v1";
    }

    fn message(id: &str, key: &str) -> CommandMessage {
        CommandMessage::new(id, key, &Ping, "tests").expect("encoding should succeed")
    }

    #[tokio::test]
    async fn delivers_buffered_and_live_messages_in_order() {
        let queue = InMemoryQueueClient::new();
        queue.push(message("m-1", "a"));
        queue.push(message("m-2", "a"));

        let mut stream = queue
            .subscribe("commands", "group-a")
            .await
            .expect("subscribe succeeds");

        queue.push(message("m-3", "b"));

        let mut seen = Vec::new();
        for _ in 0..3 {
            let ctx = stream
                .next()
                .await
                .expect("stream open")
                .expect("no transport error");
            seen.push(ctx.message_id().to_string());
        }
        assert_eq!(seen, vec!["m-1", "m-2", "m-3"]);
    }

    #[tokio::test]
    async fn records_commits_by_message() {
        let queue = InMemoryQueueClient::new();
        queue.push(message("m-1", "a"));

        let mut stream = queue
            .subscribe("commands", "group-a")
            .await
            .expect("subscribe succeeds");
        let ctx = stream
            .next()
            .await
            .expect("stream open")
            .expect("no transport error");

        assert!(!queue.is_committed("m-1"));
        queue.commit(&ctx.token).await.expect("commit succeeds");
        assert!(queue.is_committed("m-1"));
    }

    #[tokio::test]
    async fn injected_publish_failure_only_hits_destination() {
        let queue = InMemoryQueueClient::new();
        queue.fail_publishes_to("broken");

        let ctx = {
            queue.push(message("m-1", "a"));
            let mut stream = queue
                .subscribe("commands", "g")
                .await
                .expect("subscribe succeeds");
            stream
                .next()
                .await
                .expect("stream open")
                .expect("no transport error")
        };

        let ok = mailroom_core::envelope::OutboundEnvelope::wrap_event(
            &ctx,
            mailroom_core::scope::RaisedEvent {
                event_type: "E.v1".to_string(),
                topic: "fine".to_string(),
                key: "k".to_string(),
                body: vec![],
            },
            "tests",
        );
        let bad = mailroom_core::envelope::OutboundEnvelope::wrap_event(
            &ctx,
            mailroom_core::scope::RaisedEvent {
                event_type: "E.v1".to_string(),
                topic: "broken".to_string(),
                key: "k".to_string(),
                body: vec![],
            },
            "tests",
        );

        assert!(queue.publish(&ok).await.is_ok());
        assert!(queue.publish(&bad).await.is_err());
        assert_eq!(queue.published_to("fine").len(), 1);
        assert!(queue.published_to("broken").is_empty());
    }
}

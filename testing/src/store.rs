//! In-memory message store for tests.
//!
//! Models the exactly-once contract faithfully: `save_command` refuses a
//! duplicate `(message_id, consumer_group)` pair and writes the handled
//! record and outbox rows together. Store errors can be injected to drive
//! the pipeline's conflict-retry and failure paths.

use chrono::{DateTime, Utc};
use mailroom_core::envelope::OutboundEnvelope;
use mailroom_core::message::MessageContext;
use mailroom_core::store::{MessageStore, StoreError};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// A recorded handled command.
#[derive(Clone, Debug)]
pub struct HandledRecord {
    /// When the command was handled.
    pub handled_at: DateTime<Utc>,
    /// Summary of the outcome (envelope counts).
    pub summary: String,
}

/// A recorded failed command.
#[derive(Clone, Debug)]
pub struct FailedRecord {
    /// The failed message id.
    pub message_id: String,
    /// Consumer group that failed it.
    pub consumer_group: String,
    /// Failure classification.
    pub error_type: String,
    /// Failure message.
    pub error_message: String,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
struct OutboxRow {
    envelope: OutboundEnvelope,
    dispatched: bool,
}

/// Errors queued for injection into upcoming `save_command` calls.
#[derive(Clone, Copy, Debug)]
enum InjectedError {
    Conflict,
    Database,
}

#[derive(Default)]
struct StoreState {
    handled: HashMap<(String, String), HandledRecord>,
    outbox: Vec<OutboxRow>,
    failed: Vec<FailedRecord>,
    rollbacks: usize,
    fail_next_saves: VecDeque<InjectedError>,
    fail_probe: bool,
}

/// In-memory [`MessageStore`] with failure injection.
///
/// Clone freely; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryMessageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `count` concurrency conflicts for upcoming `save_command`
    /// calls.
    pub fn fail_next_saves_with_conflict(&self, count: usize) {
        let mut state = self.lock();
        for _ in 0..count {
            state.fail_next_saves.push_back(InjectedError::Conflict);
        }
    }

    /// Queue a database error for the next `save_command` call.
    pub fn fail_next_save_with_database_error(&self) {
        self.lock().fail_next_saves.push_back(InjectedError::Database);
    }

    /// Make `has_command_handled` fail until cleared.
    pub fn fail_probe(&self, fail: bool) {
        self.lock().fail_probe = fail;
    }

    /// Whether the command has a handled record.
    #[must_use]
    pub fn is_handled(&self, message_id: &str, consumer_group: &str) -> bool {
        self.lock()
            .handled
            .contains_key(&(message_id.to_string(), consumer_group.to_string()))
    }

    /// The handled record for a command, if any.
    #[must_use]
    pub fn handled_record(&self, message_id: &str, consumer_group: &str) -> Option<HandledRecord> {
        self.lock()
            .handled
            .get(&(message_id.to_string(), consumer_group.to_string()))
            .cloned()
    }

    /// Number of handled-command records.
    #[must_use]
    pub fn handled_count(&self) -> usize {
        self.lock().handled.len()
    }

    /// All outbox envelopes, in insertion order.
    #[must_use]
    pub fn outbox(&self) -> Vec<OutboundEnvelope> {
        self.lock().outbox.iter().map(|r| r.envelope.clone()).collect()
    }

    /// Outbox envelopes produced by the given command.
    #[must_use]
    pub fn outbox_for(&self, message_id: &str) -> Vec<OutboundEnvelope> {
        self.lock()
            .outbox
            .iter()
            .filter(|r| r.envelope.source_command_id() == message_id)
            .map(|r| r.envelope.clone())
            .collect()
    }

    /// Number of outbox rows not yet marked dispatched.
    #[must_use]
    pub fn undispatched_count(&self) -> usize {
        self.lock().outbox.iter().filter(|r| !r.dispatched).count()
    }

    /// All failure records, in insertion order.
    #[must_use]
    pub fn failed(&self) -> Vec<FailedRecord> {
        self.lock().failed.clone()
    }

    /// Number of `rollback` calls observed.
    #[must_use]
    pub fn rollback_count(&self) -> usize {
        self.lock().rollbacks
    }

    fn summarize(envelopes: &[OutboundEnvelope]) -> String {
        let events = envelopes.iter().filter(|e| e.is_event()).count();
        let replies = envelopes.len() - events;
        format!("events={events} replies={replies}")
    }
}

impl MessageStore for InMemoryMessageStore {
    fn has_command_handled(
        &self,
        message_id: &str,
        consumer_group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + '_>> {
        let key = (message_id.to_string(), consumer_group.to_string());
        Box::pin(async move {
            let state = self.lock();
            if state.fail_probe {
                return Err(StoreError::Database("injected probe failure".to_string()));
            }
            Ok(state.handled.contains_key(&key))
        })
    }

    fn save_command<'a>(
        &'a self,
        ctx: &'a MessageContext,
        envelopes: &'a [OutboundEnvelope],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.lock();

            if let Some(injected) = state.fail_next_saves.pop_front() {
                return Err(match injected {
                    InjectedError::Conflict => StoreError::ConcurrencyConflict(
                        "injected version conflict".to_string(),
                    ),
                    InjectedError::Database => {
                        StoreError::Database("injected database error".to_string())
                    },
                });
            }

            let key = (ctx.message_id().to_string(), ctx.consumer_group.clone());
            if state.handled.contains_key(&key) {
                return Err(StoreError::DuplicateCommand {
                    message_id: key.0,
                    consumer_group: key.1,
                });
            }

            // Handled record and outbox rows land together, as one
            // transaction would.
            state.handled.insert(
                key,
                HandledRecord {
                    handled_at: Utc::now(),
                    summary: Self::summarize(envelopes),
                },
            );
            for envelope in envelopes {
                state.outbox.push(OutboxRow {
                    envelope: envelope.clone(),
                    dispatched: false,
                });
            }
            Ok(())
        })
    }

    fn save_failed_command<'a>(
        &'a self,
        ctx: &'a MessageContext,
        error_type: &'a str,
        error_message: &'a str,
        envelopes: &'a [OutboundEnvelope],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.failed.push(FailedRecord {
                message_id: ctx.message_id().to_string(),
                consumer_group: ctx.consumer_group.clone(),
                error_type: error_type.to_string(),
                error_message: error_message.to_string(),
                failed_at: Utc::now(),
            });
            for envelope in envelopes {
                state.outbox.push(OutboxRow {
                    envelope: envelope.clone(),
                    dispatched: false,
                });
            }
            Ok(())
        })
    }

    fn rollback(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.lock().rollbacks += 1;
            Ok(())
        })
    }

    fn fetch_undispatched(
        &self,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboundEnvelope>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .outbox
                .iter()
                .filter(|r| !r.dispatched)
                .take(limit as usize)
                .map(|r| r.envelope.clone())
                .collect())
        })
    }

    fn mark_dispatched<'a>(
        &'a self,
        envelope_ids: &'a [Uuid],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.lock();
            for row in &mut state.outbox {
                if envelope_ids.contains(&row.envelope.envelope_id) {
                    row.dispatched = true;
                }
            }
            Ok(())
        })
    }
}

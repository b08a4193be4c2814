//! `PostgreSQL` message store for Mailroom.
//!
//! Implements the [`MessageStore`] contract over sqlx with three tables:
//!
//! - `handled_commands` — the idempotency markers, keyed by
//!   `(message_id, consumer_group)`
//! - `outbox` — durable outbound envelopes with a monotonic `seq`
//!   preserving collection order, and a `dispatched_at` stamp driven by the
//!   inline publish and the [`OutboxRelay`]
//! - `failed_commands` — failure records; a message can fail more than
//!   once because failures are not idempotency gates
//!
//! `save_command` writes the handled record and the outbox rows in a single
//! transaction, which is the whole exactly-once story: either the command's
//! effects are durable together, or the transaction never happened and the
//! queue redelivers.
//!
//! # Error mapping
//!
//! - unique violation (`23505`) on `handled_commands` →
//!   [`StoreError::DuplicateCommand`]
//! - serialization failure (`40001`) / deadlock (`40P01`) →
//!   [`StoreError::ConcurrencyConflict`]

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod relay;

pub use relay::OutboxRelay;

use mailroom_core::envelope::OutboundEnvelope;
use mailroom_core::message::MessageContext;
use mailroom_core::store::{MessageStore, StoreError};
use sqlx::PgPool;
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// `PostgreSQL`-backed [`MessageStore`].
///
/// # Example
///
/// ```no_run
/// use mailroom_postgres::PostgresMessageStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresMessageStore::new("postgres://localhost/mailroom").await?;
/// store.ensure_schema().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresMessageStore {
    pool: PgPool,
}

impl PostgresMessageStore {
    /// Connect to the database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for applications sharing it with their
    /// repositories.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the store's tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on DDL failure.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(
            r"
            CREATE TABLE IF NOT EXISTS handled_commands (
                message_id TEXT NOT NULL,
                consumer_group TEXT NOT NULL,
                handled_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                summary TEXT NOT NULL,
                PRIMARY KEY (message_id, consumer_group)
            );

            CREATE TABLE IF NOT EXISTS outbox (
                envelope_id UUID PRIMARY KEY,
                seq BIGSERIAL,
                source_command_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                destination TEXT NOT NULL,
                envelope BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                dispatched_at TIMESTAMPTZ
            );

            CREATE INDEX IF NOT EXISTS idx_outbox_undispatched
                ON outbox(seq) WHERE dispatched_at IS NULL;
            CREATE INDEX IF NOT EXISTS idx_outbox_source
                ON outbox(source_command_id);

            CREATE TABLE IF NOT EXISTS failed_commands (
                id BIGSERIAL PRIMARY KEY,
                message_id TEXT NOT NULL,
                consumer_group TEXT NOT NULL,
                error_type TEXT NOT NULL,
                error_message TEXT NOT NULL,
                failed_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE INDEX IF NOT EXISTS idx_failed_commands_message
                ON failed_commands(message_id, consumer_group);
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::info!("Message store schema ensured");
        Ok(())
    }

    fn map_save_error(e: &sqlx::Error, ctx: &MessageContext) -> StoreError {
        if let sqlx::Error::Database(db) = e {
            match db.code().as_deref() {
                Some("23505") => {
                    return StoreError::DuplicateCommand {
                        message_id: ctx.message_id().to_string(),
                        consumer_group: ctx.consumer_group.clone(),
                    };
                },
                Some("40001" | "40P01") => {
                    return StoreError::ConcurrencyConflict(db.message().to_string());
                },
                _ => {},
            }
        }
        StoreError::Database(e.to_string())
    }

    async fn insert_outbox_rows(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        envelopes: &[OutboundEnvelope],
    ) -> Result<(), StoreError> {
        for envelope in envelopes {
            let bytes = envelope
                .to_bytes()
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let kind = if envelope.is_event() { "event" } else { "reply" };
            sqlx::query(
                r"
                INSERT INTO outbox (envelope_id, source_command_id, kind, destination, envelope)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(envelope.envelope_id)
            .bind(envelope.source_command_id())
            .bind(kind)
            .bind(envelope.destination())
            .bind(&bytes)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        Ok(())
    }

    fn summarize(envelopes: &[OutboundEnvelope]) -> String {
        let events = envelopes.iter().filter(|e| e.is_event()).count();
        let replies = envelopes.len() - events;
        format!("events={events} replies={replies}")
    }
}

impl MessageStore for PostgresMessageStore {
    fn has_command_handled(
        &self,
        message_id: &str,
        consumer_group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + '_>> {
        let message_id = message_id.to_string();
        let consumer_group = consumer_group.to_string();
        Box::pin(async move {
            let handled: bool = sqlx::query_scalar(
                r"
                SELECT EXISTS(
                    SELECT 1 FROM handled_commands
                    WHERE message_id = $1 AND consumer_group = $2
                )
                ",
            )
            .bind(&message_id)
            .bind(&consumer_group)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
            Ok(handled)
        })
    }

    fn save_command<'a>(
        &'a self,
        ctx: &'a MessageContext,
        envelopes: &'a [OutboundEnvelope],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;

            sqlx::query(
                r"
                INSERT INTO handled_commands (message_id, consumer_group, summary)
                VALUES ($1, $2, $3)
                ",
            )
            .bind(ctx.message_id())
            .bind(&ctx.consumer_group)
            .bind(Self::summarize(envelopes))
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::map_save_error(&e, ctx))?;

            Self::insert_outbox_rows(&mut tx, envelopes).await?;

            tx.commit()
                .await
                .map_err(|e| Self::map_save_error(&e, ctx))?;

            tracing::debug!(
                message_id = ctx.message_id(),
                envelopes = envelopes.len(),
                "Command handling persisted"
            );
            metrics::counter!("store_commands_saved_total").increment(1);
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
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;

            sqlx::query(
                r"
                INSERT INTO failed_commands (message_id, consumer_group, error_type, error_message)
                VALUES ($1, $2, $3, $4)
                ",
            )
            .bind(ctx.message_id())
            .bind(&ctx.consumer_group)
            .bind(error_type)
            .bind(error_message)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            Self::insert_outbox_rows(&mut tx, envelopes).await?;

            tx.commit()
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;

            tracing::warn!(
                message_id = ctx.message_id(),
                error_type,
                error = error_message,
                "Command failure recorded"
            );
            metrics::counter!("store_commands_failed_total", "error_type" => error_type.to_string())
                .increment(1);
            Ok(())
        })
    }

    fn rollback(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            // Every save runs in its own transaction, so an aborted attempt
            // left nothing staged here. Application repositories sharing the
            // pool roll their own transactions back when the scope drops.
            tracing::trace!("Rollback requested, no scope-local state to release");
            Ok(())
        })
    }

    fn fetch_undispatched(
        &self,
        limit: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboundEnvelope>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows: Vec<Vec<u8>> = sqlx::query_scalar(
                r"
                SELECT envelope FROM outbox
                WHERE dispatched_at IS NULL
                ORDER BY seq ASC
                LIMIT $1
                ",
            )
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            rows.iter()
                .map(|bytes| {
                    OutboundEnvelope::from_bytes(bytes)
                        .map_err(|e| StoreError::Serialization(e.to_string()))
                })
                .collect()
        })
    }

    fn mark_dispatched<'a>(
        &'a self,
        envelope_ids: &'a [Uuid],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            if envelope_ids.is_empty() {
                return Ok(());
            }
            sqlx::query(
                r"
                UPDATE outbox SET dispatched_at = now()
                WHERE envelope_id = ANY($1) AND dispatched_at IS NULL
                ",
            )
            .bind(envelope_ids)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
            Ok(())
        })
    }
}

//! Persisted outbox of messages waiting for delivery.
//!
//! Rows move NEW → SENDING (claimed) → SENT | FAILED | DEAD, or back to NEW with a later
//! `next_attempt_at`. Every update after the claim is conditioned on `status = 'SENDING'`
//! and on `claimed_by` still naming the caller, so a worker whose claim was recovered and
//! handed to another worker can no longer finish the row.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool};

use courier_common::error::AppError;
use courier_common::types::{NewOutboxMessage, OutboxMessage, OutboxStatus};

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a message. Returns `false` when a row with the same idempotency key exists.
    async fn enqueue(&self, message: &NewOutboxMessage) -> Result<bool, AppError>;

    /// Atomically move up to `limit` due NEW rows to SENDING for `worker_id`.
    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<Vec<OutboxMessage>, AppError>;

    /// Finish a row claimed by `worker_id`. Returns `false` if that claim no longer holds.
    async fn mark_terminal(
        &self,
        id: i64,
        worker_id: &str,
        status: OutboxStatus,
        attempt_count: i32,
        error: Option<&str>,
    ) -> Result<bool, AppError>;

    /// Put a row claimed by `worker_id` back to NEW, due at `next_attempt_at`.
    async fn reschedule(
        &self,
        id: i64,
        worker_id: &str,
        next_attempt_at: DateTime<Utc>,
        attempt_count: i32,
        error: Option<&str>,
    ) -> Result<bool, AppError>;

    /// Whether a row with this idempotency key was delivered.
    async fn is_sent(&self, idempotency_key: &str) -> Result<bool, AppError>;

    /// Number of rows that are not terminal yet.
    async fn depth(&self) -> Result<u64, AppError>;

    /// Release SENDING rows untouched for longer than `older_than` back to NEW.
    async fn recover_stale(&self, older_than: Duration) -> Result<u64, AppError>;
}

/// Insert one outbox row with any executor, so campaign batches can share a transaction.
pub async fn insert_message<'e, E>(executor: E, message: &NewOutboxMessage) -> Result<bool, AppError>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO notifications_outbox
            (chat_id, thread_id, method, payload, idempotency_key, campaign_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (idempotency_key) DO NOTHING
        "#,
    )
    .bind(message.chat_id)
    .bind(message.thread_id)
    .bind(message.method)
    .bind(Json(&message.payload))
    .bind(&message.idempotency_key)
    .bind(message.campaign_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// PostgreSQL-backed outbox.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn enqueue(&self, message: &NewOutboxMessage) -> Result<bool, AppError> {
        let inserted = insert_message(&self.pool, message).await?;
        if !inserted {
            tracing::debug!(
                idempotency_key = %message.idempotency_key,
                "Duplicate outbox message ignored"
            );
        }
        Ok(inserted)
    }

    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<Vec<OutboxMessage>, AppError> {
        let mut rows = sqlx::query_as::<_, OutboxMessage>(
            r#"
            WITH ready AS (
                SELECT id
                FROM notifications_outbox
                WHERE status = 'NEW'
                  AND next_attempt_at <= $1
                ORDER BY next_attempt_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE notifications_outbox o
            SET status = 'SENDING',
                claimed_by = $3,
                updated_at = NOW()
            FROM ready
            WHERE o.id = ready.id
              AND o.status = 'NEW'
            RETURNING o.id, o.chat_id, o.thread_id, o.method, o.payload, o.idempotency_key,
                      o.campaign_id, o.status, o.attempt_count, o.next_attempt_at,
                      o.last_error, o.claimed_by, o.created_at, o.updated_at
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        rows.sort_by_key(|row| (row.next_attempt_at, row.id));
        Ok(rows)
    }

    async fn mark_terminal(
        &self,
        id: i64,
        worker_id: &str,
        status: OutboxStatus,
        attempt_count: i32,
        error: Option<&str>,
    ) -> Result<bool, AppError> {
        if !status.is_terminal() {
            return Err(AppError::Validation(format!(
                "{} is not a terminal outbox status",
                status
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE notifications_outbox
            SET status = $3,
                attempt_count = $4,
                last_error = $5,
                claimed_by = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'SENDING' AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(status)
        .bind(attempt_count)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reschedule(
        &self,
        id: i64,
        worker_id: &str,
        next_attempt_at: DateTime<Utc>,
        attempt_count: i32,
        error: Option<&str>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications_outbox
            SET status = 'NEW',
                next_attempt_at = $3,
                attempt_count = $4,
                last_error = COALESCE($5, last_error),
                claimed_by = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'SENDING' AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(next_attempt_at)
        .bind(attempt_count)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn is_sent(&self, idempotency_key: &str) -> Result<bool, AppError> {
        let sent: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM notifications_outbox
                WHERE idempotency_key = $1 AND status = 'SENT'
            )
            "#,
        )
        .bind(idempotency_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(sent)
    }

    async fn depth(&self) -> Result<u64, AppError> {
        let depth: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications_outbox WHERE status IN ('NEW', 'SENDING')",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(depth.max(0) as u64)
    }

    async fn recover_stale(&self, older_than: Duration) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications_outbox
            SET status = 'NEW',
                claimed_by = NULL,
                next_attempt_at = NOW(),
                updated_at = NOW()
            WHERE status = 'SENDING'
              AND updated_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

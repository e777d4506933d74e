//! Outbox: transactional enqueue plus WorkQueue dispatch with fan-in join
//! advancement on ack/fail.
//!
//! `claim` is not delegated to `WorkQueueEngine` because handlers need the
//! full row (`topic`, `payload`, ...), not just the id; `ack`/`fail` are not
//! delegated either because they must advance `relay.outbox_join` counters
//! in the same transaction as the status flip. `abandon`/`reap_expired`/
//! `delete_done_older_than` carry no join semantics and are reused as-is.

use crate::workqueue::{WorkQueueEngine, OUTBOX_TABLE};
use chrono::{DateTime, Utc};
use relay_core::{Error, MessageId, OutboxRow, OwnerToken, Result, Topic, WorkItemId};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinOutcome {
    Completed,
    Failed,
}

impl JoinOutcome {
    fn member_status(self) -> &'static str {
        match self {
            JoinOutcome::Completed => "Completed",
            JoinOutcome::Failed => "Failed",
        }
    }

    fn counter_column(self) -> &'static str {
        match self {
            JoinOutcome::Completed => "completed_steps",
            JoinOutcome::Failed => "failed_steps",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxStore {
    pool: PgPool,
    engine: WorkQueueEngine,
}

impl OutboxStore {
    pub fn new(pool: PgPool) -> Self {
        let engine = WorkQueueEngine::new(pool.clone(), OUTBOX_TABLE);
        Self { pool, engine }
    }

    /// Inserts a row using an internally-opened transaction that commits
    /// before returning.
    pub async fn enqueue(
        &self,
        topic: &Topic,
        payload: Value,
        correlation_id: Option<&str>,
        due_time_utc: Option<DateTime<Utc>>,
    ) -> Result<(WorkItemId, MessageId)> {
        let mut tx = self.pool.begin().await?;
        let ids = self
            .enqueue_in_tx(&mut tx, topic, payload, correlation_id, due_time_utc)
            .await?;
        tx.commit().await?;
        Ok(ids)
    }

    /// Inserts a row participating in a caller-supplied transaction; the
    /// caller commits. Lets producers make the enqueue atomic with their
    /// own business writes.
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        topic: &Topic,
        payload: Value,
        correlation_id: Option<&str>,
        due_time_utc: Option<DateTime<Utc>>,
    ) -> Result<(WorkItemId, MessageId)> {
        let id = WorkItemId::new();
        let message_id = MessageId::new();
        sqlx::query(
            r#"
            INSERT INTO relay.outbox
                (id, message_id, topic, payload, correlation_id, due_time_utc, status, retry_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 0, 0, now())
            "#,
        )
        .bind(id.as_uuid())
        .bind(message_id.as_uuid())
        .bind(topic.as_str())
        .bind(payload)
        .bind(correlation_id)
        .bind(due_time_utc)
        .execute(&mut **tx)
        .await?;
        Ok((id, message_id))
    }

    /// Atomically reserves up to `batch_size` Ready rows for `owner` and
    /// returns their full contents for handler dispatch.
    pub async fn claim(
        &self,
        owner: OwnerToken,
        lease_seconds: i64,
        batch_size: i64,
    ) -> Result<Vec<OutboxRow>> {
        if lease_seconds <= 0 {
            return Err(Error::validation("leaseSeconds must be > 0"));
        }
        if batch_size <= 0 {
            return Err(Error::validation("batchSize must be > 0"));
        }

        let rows = sqlx::query(
            r#"
            WITH picked AS (
                SELECT id
                FROM relay.outbox
                WHERE status = 0
                  AND (locked_until IS NULL OR locked_until <= now())
                  AND (due_time_utc IS NULL OR due_time_utc <= now())
                  AND (next_attempt_at IS NULL OR next_attempt_at <= now())
                ORDER BY created_at, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE relay.outbox AS t
            SET status = 1,
                owner_token = $1,
                locked_until = now() + ($2::text || ' seconds')::interval
            FROM picked
            WHERE t.id = picked.id
            RETURNING t.id, t.message_id, t.topic, t.payload, t.correlation_id, t.retry_count, t.created_at
            "#,
        )
        .bind(owner.as_uuid())
        .bind(lease_seconds.to_string())
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(OutboxRow {
                    id: WorkItemId::from_uuid(row.try_get::<Uuid, _>("id")?),
                    message_id: MessageId::from_uuid(row.try_get::<Uuid, _>("message_id")?),
                    topic: row.try_get("topic")?,
                    payload: row.try_get("payload")?,
                    correlation_id: row.try_get("correlation_id")?,
                    retry_count: row.try_get("retry_count")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Transitions `InProgress -> Done` for rows owned by `owner`, then
    /// advances `completed_steps` on any join those messages belong to, in
    /// the same transaction.
    pub async fn ack(&self, owner: OwnerToken, ids: &[WorkItemId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
        let mut tx = self.pool.begin().await?;

        let acked_rows = sqlx::query(
            r#"
            UPDATE relay.outbox
            SET status = 2,
                processed_at = now(),
                processed_by = $1,
                owner_token = NULL,
                locked_until = NULL
            WHERE id = ANY($2)
              AND owner_token = $1
              AND status = 1
            RETURNING message_id
            "#,
        )
        .bind(owner.as_uuid())
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        let message_ids: Vec<Uuid> = acked_rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("message_id"))
            .collect::<std::result::Result<_, _>>()?;

        advance_join_counters(&mut tx, &message_ids, JoinOutcome::Completed).await?;

        tx.commit().await?;
        Ok(acked_rows.len() as u64)
    }

    /// Transitions `InProgress -> Ready`, scheduling the next attempt.
    /// Carries no join semantics (a join only advances on terminal
    /// ack/fail), so it is a thin pass-through to the shared engine.
    pub async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[WorkItemId],
        last_error: Option<&str>,
        retry_delay: Option<Duration>,
    ) -> Result<u64> {
        self.engine.abandon(owner, ids, last_error, retry_delay).await
    }

    /// Transitions `InProgress -> Failed`, then advances `failed_steps` on
    /// any join those messages belong to, in the same transaction.
    pub async fn fail(&self, owner: OwnerToken, ids: &[WorkItemId], reason: Option<&str>) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
        let mut tx = self.pool.begin().await?;

        let failed_rows = sqlx::query(
            r#"
            UPDATE relay.outbox
            SET status = 3,
                owner_token = NULL,
                locked_until = NULL,
                last_error = COALESCE($3, last_error)
            WHERE id = ANY($2)
              AND owner_token = $1
              AND status = 1
            RETURNING message_id
            "#,
        )
        .bind(owner.as_uuid())
        .bind(&ids)
        .bind(reason)
        .fetch_all(&mut *tx)
        .await?;

        let message_ids: Vec<Uuid> = failed_rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("message_id"))
            .collect::<std::result::Result<_, _>>()?;

        advance_join_counters(&mut tx, &message_ids, JoinOutcome::Failed).await?;

        tx.commit().await?;
        Ok(failed_rows.len() as u64)
    }

    pub async fn reap_expired(&self, batch_limit: i64) -> Result<u64> {
        self.engine.reap_expired(batch_limit).await
    }

    pub async fn delete_done_older_than(&self, retention: Duration, batch_limit: i64) -> Result<u64> {
        self.engine.delete_done_older_than(retention, batch_limit).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Marks non-terminal `outbox_join_member` rows for `message_ids` as
/// `outcome` and bumps the owning join's counter by the count of members
/// updated per join — both inside the caller's transaction, so an ack/fail
/// and its join advancement always commit or roll back together.
pub(crate) async fn advance_join_counters(
    tx: &mut Transaction<'_, Postgres>,
    message_ids: &[Uuid],
    outcome: JoinOutcome,
) -> Result<()> {
    if message_ids.is_empty() {
        return Ok(());
    }
    let sql = format!(
        r#"
        WITH member_updates AS (
            UPDATE relay.outbox_join_member
            SET status = $2
            WHERE outbox_message_id = ANY($1)
              AND status NOT IN ('Completed', 'Failed')
            RETURNING join_id
        ),
        per_join AS (
            SELECT join_id, count(*) AS cnt FROM member_updates GROUP BY join_id
        )
        UPDATE relay.outbox_join j
        SET {column} = j.{column} + per_join.cnt
        FROM per_join
        WHERE j.join_id = per_join.join_id
        "#,
        column = outcome.counter_column(),
    );
    sqlx::query(&sql)
        .bind(message_ids)
        .bind(outcome.member_status())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

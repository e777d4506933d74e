//! Generic claim/ack/abandon/fail/reap primitive over a WorkItem-shaped
//! table.
//!
//! Every table driven by this engine shares the WorkItem column set:
//! `id uuid`, `status smallint`, `owner_token uuid`,
//! `locked_until timestamptz`, `retry_count int`, `last_error text`,
//! `next_attempt_at timestamptz`, `due_time_utc timestamptz`,
//! `created_at timestamptz`, plus `processed_at`/`processed_by` set on ack.
//! Outbox, Timers and JobRuns all use this engine directly; Inbox has its
//! own claim/ack/abandon/fail in `inbox.rs` because it is keyed by a
//! composite `(message_id, source)` pair rather than a single uuid.
//!
//! The claim statement mirrors `trace-core`'s `pgqueue.rs` `receive()`:
//! a `SELECT ... FOR UPDATE SKIP LOCKED` CTE feeding an `UPDATE ... FROM`,
//! so concurrent claimers never block on each other's in-flight rows.

use relay_core::{Error, ErrorKind, OwnerToken, Result, WorkItemId};
use sqlx::{PgPool, Row};
use std::time::Duration;

/// Static description of a WorkItem-shaped table. `order_column` is the
/// eligibility-time column used to break ties deterministically: claim
/// orders by eligibility time, then by id.
#[derive(Debug, Clone, Copy)]
pub struct WorkQueueTable {
    pub table: &'static str,
    pub order_column: &'static str,
}

pub const OUTBOX_TABLE: WorkQueueTable = WorkQueueTable {
    table: "relay.outbox",
    order_column: "created_at",
};

pub const TIMERS_TABLE: WorkQueueTable = WorkQueueTable {
    table: "relay.timers",
    order_column: "due_time_utc",
};

pub const JOB_RUNS_TABLE: WorkQueueTable = WorkQueueTable {
    table: "relay.job_runs",
    order_column: "scheduled_time",
};

pub const INBOX_TABLE: WorkQueueTable = WorkQueueTable {
    table: "relay.inbox",
    order_column: "last_seen_utc",
};

#[derive(Debug, Clone)]
pub struct WorkQueueEngine {
    pool: PgPool,
    table: WorkQueueTable,
}

fn validate_claim_args(lease_seconds: i64, batch_size: i64) -> Result<()> {
    if lease_seconds <= 0 {
        return Err(Error::validation("leaseSeconds must be > 0"));
    }
    if batch_size <= 0 {
        return Err(Error::validation("batchSize must be > 0"));
    }
    Ok(())
}

impl WorkQueueEngine {
    pub fn new(pool: PgPool, table: WorkQueueTable) -> Self {
        Self { pool, table }
    }

    /// Atomically reserves up to `batch_size` Ready, eligible rows for
    /// `owner`, returning their ids in eligibility order.
    pub async fn claim(
        &self,
        owner: OwnerToken,
        lease_seconds: i64,
        batch_size: i64,
    ) -> Result<Vec<WorkItemId>> {
        validate_claim_args(lease_seconds, batch_size)?;

        let sql = format!(
            r#"
            WITH picked AS (
                SELECT id
                FROM {table}
                WHERE status = 0
                  AND (locked_until IS NULL OR locked_until <= now())
                  AND (due_time_utc IS NULL OR due_time_utc <= now())
                  AND (next_attempt_at IS NULL OR next_attempt_at <= now())
                ORDER BY {order_column}, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} AS t
            SET status = 1,
                owner_token = $1,
                locked_until = now() + ($2::text || ' seconds')::interval
            FROM picked
            WHERE t.id = picked.id
            RETURNING t.id
            "#,
            table = self.table.table,
            order_column = self.table.order_column,
        );

        let rows = sqlx::query(&sql)
            .bind(owner.as_uuid())
            .bind(lease_seconds.to_string())
            .bind(batch_size)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| Ok(WorkItemId::from_uuid(row.try_get::<uuid::Uuid, _>("id")?)))
            .collect()
    }

    /// Transitions `InProgress -> Done` for rows still owned by `owner`.
    /// Mismatched or already-terminal ids are silently skipped; the
    /// returned count may be less than `ids.len()`.
    pub async fn ack(&self, owner: OwnerToken, ids: &[WorkItemId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<uuid::Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 2,
                processed_at = now(),
                processed_by = $1,
                owner_token = NULL,
                locked_until = NULL
            WHERE id = ANY($2)
              AND owner_token = $1
              AND status = 1
            "#,
            table = self.table.table
        );
        let res = sqlx::query(&sql)
            .bind(owner.as_uuid())
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Transitions `InProgress -> Ready`, incrementing `retry_count` and
    /// scheduling the next attempt. `retry_delay` defaults to
    /// `min(2^retry_count, 60s)` when `None`.
    pub async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[WorkItemId],
        last_error: Option<&str>,
        retry_delay: Option<Duration>,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<uuid::Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 0,
                owner_token = NULL,
                locked_until = NULL,
                retry_count = retry_count + 1,
                last_error = COALESCE($3, last_error),
                next_attempt_at = now() + (
                    COALESCE($4, LEAST(POWER(2, retry_count + 1), 60))::text || ' seconds'
                )::interval
            WHERE id = ANY($2)
              AND owner_token = $1
              AND status = 1
            "#,
            table = self.table.table
        );
        let retry_delay_secs = retry_delay.map(|d| d.as_secs_f64());
        let res = sqlx::query(&sql)
            .bind(owner.as_uuid())
            .bind(&ids)
            .bind(last_error)
            .bind(retry_delay_secs)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Transitions `InProgress -> Failed` (terminal). Owner-mismatched ids
    /// are silently skipped.
    pub async fn fail(&self, owner: OwnerToken, ids: &[WorkItemId], reason: Option<&str>) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<uuid::Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 3,
                owner_token = NULL,
                locked_until = NULL,
                last_error = COALESCE($3, last_error)
            WHERE id = ANY($2)
              AND owner_token = $1
              AND status = 1
            "#,
            table = self.table.table
        );
        let res = sqlx::query(&sql)
            .bind(owner.as_uuid())
            .bind(&ids)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Restores expired `InProgress` rows to `Ready`. Idempotent, safe to
    /// run concurrently with claimers.
    pub async fn reap_expired(&self, batch_limit: i64) -> Result<u64> {
        let sql = format!(
            r#"
            WITH expired AS (
                SELECT id
                FROM {table}
                WHERE status = 1
                  AND locked_until IS NOT NULL
                  AND locked_until <= now()
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} AS t
            SET status = 0,
                owner_token = NULL,
                locked_until = NULL
            FROM expired
            WHERE t.id = expired.id
            "#,
            table = self.table.table
        );
        let res = sqlx::query(&sql)
            .bind(batch_limit)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Deletes `Done` rows older than `retention`, in bounded batches
    ///.
    pub async fn delete_done_older_than(
        &self,
        retention: Duration,
        batch_limit: i64,
    ) -> Result<u64> {
        let sql = format!(
            r#"
            WITH victims AS (
                SELECT id
                FROM {table}
                WHERE status = 2
                  AND processed_at IS NOT NULL
                  AND processed_at <= now() - ($1::text || ' seconds')::interval
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            DELETE FROM {table}
            WHERE id IN (SELECT id FROM victims)
            "#,
            table = self.table.table
        );
        let res = sqlx::query(&sql)
            .bind(retention.as_secs_f64())
            .bind(batch_limit)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Caller-facing row state used by the `claim`/`reap` retry math. Exposed so
/// `relay-dispatcher` can compute the abandon-vs-fail decision without re-deriving it.
pub fn exceeds_retry_ceiling(retry_count: i32, ceiling: i32) -> bool {
    retry_count > ceiling
}

pub fn classify_transient(err: &relay_core::Error) -> bool {
    err.kind() == ErrorKind::TransientStorage
}

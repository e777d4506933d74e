//! Inbox: at-most-once processing via atomic upsert-on-arrival, then the
//! same claim/ack/abandon/fail/reap lifecycle as Outbox.
//!
//! The table carries two independent status concepts: `processing_status`
//! (text: Seen/Processing/Done/Dead), the business-level idempotency state
//! callers query via `already_processed`/`mark_*`; and `status` (smallint
//! 0-3), the WorkQueue lifecycle column `WorkQueueEngine` drives. Keeping
//! them separate lets Inbox reuse the engine unmodified for ack/abandon/
//! fail/reap while still exposing the business states callers need.
//! The composite key `(message_id, source)` is enforced by a unique
//! constraint; a surrogate `id uuid` primary key is what the engine and
//! `claim` actually operate on, since skip-locked claim needs a single
//! sortable key.

use crate::workqueue::{WorkQueueEngine, INBOX_TABLE};
use chrono::{DateTime, Utc};
use relay_core::{Error, InboxRow, OwnerToken, Result, WorkItemId};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboxEnqueueOutcome {
    pub id: WorkItemId,
    pub created: bool,
    pub already_terminal: bool,
}

#[derive(Debug, Clone)]
pub struct InboxStore {
    pool: PgPool,
    engine: WorkQueueEngine,
}

impl InboxStore {
    pub fn new(pool: PgPool) -> Self {
        let engine = WorkQueueEngine::new(pool.clone(), INBOX_TABLE);
        Self { pool, engine }
    }

    /// Upserts on `(message_id, source)`. A fresh pair is inserted with
    /// `processing_status = Seen`, `attempts = 0`; an existing pair only
    /// has `last_seen_utc`/`attempts` touched.
    pub async fn enqueue(
        &self,
        message_id: &str,
        source: &str,
        topic: &str,
        payload: Value,
        hash: Option<&str>,
        due_time_utc: Option<DateTime<Utc>>,
    ) -> Result<InboxEnqueueOutcome> {
        let row = sqlx::query(
            r#"
            INSERT INTO relay.inbox
                (id, message_id, source, topic, payload, hash, processing_status, status,
                 first_seen_utc, last_seen_utc, attempts, due_time_utc, created_at, next_attempt_at)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, 'Seen', 0, now(), now(), 0, $6, now(), now())
            ON CONFLICT (message_id, source) DO UPDATE SET
                last_seen_utc = now(),
                attempts = relay.inbox.attempts + 1
            RETURNING id, processing_status, (xmax = 0) AS created
            "#,
        )
        .bind(message_id)
        .bind(source)
        .bind(topic)
        .bind(payload)
        .bind(hash)
        .bind(due_time_utc)
        .fetch_one(&self.pool)
        .await?;

        let status: String = row.try_get("processing_status")?;
        let already_terminal = matches!(status.as_str(), "Done" | "Dead");

        Ok(InboxEnqueueOutcome {
            id: WorkItemId::from_uuid(row.try_get::<Uuid, _>("id")?),
            created: row.try_get("created")?,
            already_terminal,
        })
    }

    /// `true` if `(message_id, source)` is already `Done`, and (when
    /// `hash` is supplied) the stored hash matches — lets callers skip
    /// reprocessing a payload they have already seen and handled.
    pub async fn already_processed(
        &self,
        message_id: &str,
        source: &str,
        hash: Option<&str>,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT processing_status, hash FROM relay.inbox WHERE message_id = $1 AND source = $2",
        )
        .bind(message_id)
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };
        let status: String = row.try_get("processing_status")?;
        if status != "Done" {
            return Ok(false);
        }
        if let Some(hash) = hash {
            let stored: Option<String> = row.try_get("hash")?;
            return Ok(stored.as_deref() == Some(hash));
        }
        Ok(true)
    }

    pub async fn mark_processing(&self, message_id: &str, source: &str) -> Result<()> {
        self.set_processing_status(message_id, source, "Processing").await
    }

    pub async fn mark_processed(&self, message_id: &str, source: &str) -> Result<()> {
        self.set_processing_status(message_id, source, "Done").await
    }

    pub async fn mark_dead(&self, message_id: &str, source: &str) -> Result<()> {
        self.set_processing_status(message_id, source, "Dead").await
    }

    async fn set_processing_status(&self, message_id: &str, source: &str, status: &str) -> Result<()> {
        sqlx::query(
            "UPDATE relay.inbox SET processing_status = $3 WHERE message_id = $1 AND source = $2",
        )
        .bind(message_id)
        .bind(source)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically reserves up to `batch_size` Ready rows for `owner` and
    /// returns their full contents for handler dispatch.
    pub async fn claim(
        &self,
        owner: OwnerToken,
        lease_seconds: i64,
        batch_size: i64,
    ) -> Result<Vec<InboxRow>> {
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
                FROM relay.inbox
                WHERE status = 0
                  AND (locked_until IS NULL OR locked_until <= now())
                  AND (due_time_utc IS NULL OR due_time_utc <= now())
                  AND (next_attempt_at IS NULL OR next_attempt_at <= now())
                ORDER BY last_seen_utc, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE relay.inbox AS t
            SET status = 1,
                owner_token = $1,
                locked_until = now() + ($2::text || ' seconds')::interval
            FROM picked
            WHERE t.id = picked.id
            RETURNING t.id, t.message_id, t.source, t.topic, t.payload, t.hash,
                      t.attempts, t.retry_count, t.first_seen_utc, t.last_seen_utc
            "#,
        )
        .bind(owner.as_uuid())
        .bind(lease_seconds.to_string())
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(InboxRow {
                    id: WorkItemId::from_uuid(row.try_get::<Uuid, _>("id")?),
                    message_id: row.try_get("message_id")?,
                    source: row.try_get("source")?,
                    topic: row.try_get("topic")?,
                    payload: row.try_get("payload")?,
                    hash: row.try_get("hash")?,
                    attempts: row.try_get("attempts")?,
                    retry_count: row.try_get("retry_count")?,
                    first_seen_utc: row.try_get("first_seen_utc")?,
                    last_seen_utc: row.try_get("last_seen_utc")?,
                })
            })
            .collect()
    }

    pub async fn ack(&self, owner: OwnerToken, ids: &[WorkItemId]) -> Result<u64> {
        self.engine.ack(owner, ids).await
    }

    pub async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[WorkItemId],
        last_error: Option<&str>,
        retry_delay: Option<Duration>,
    ) -> Result<u64> {
        self.engine.abandon(owner, ids, last_error, retry_delay).await
    }

    pub async fn fail(&self, owner: OwnerToken, ids: &[WorkItemId], reason: Option<&str>) -> Result<u64> {
        self.engine.fail(owner, ids, reason).await
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

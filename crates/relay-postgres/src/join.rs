//! Fan-in join state and the `join.wait` built-in handler.
//!
//! Counter advancement on Outbox ack/fail lives in `outbox.rs` (the
//! automatic path); this module owns join/member creation
//! and the manual recovery path (`report_step_completed`/`_failed`), plus
//! the `join.wait` handler that finalizes a join once its counters catch
//! up to `expected_steps`.

use crate::outbox::{advance_join_counters, JoinOutcome, OutboxStore};
use relay_core::{HandlerOutcome, OutboxHandler, OutboxRow, Topic};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct JoinSnapshot {
    pub join_id: Uuid,
    pub expected_steps: i32,
    pub completed_steps: i32,
    pub failed_steps: i32,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct JoinStore {
    pool: PgPool,
}

impl JoinStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn start_join(
        &self,
        grouping_key: Option<&str>,
        expected_steps: i32,
        metadata: Option<Value>,
    ) -> relay_core::Result<Uuid> {
        if expected_steps < 0 {
            return Err(relay_core::Error::validation("expectedSteps must be >= 0"));
        }
        let join_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO relay.outbox_join
                (join_id, grouping_key, expected_steps, completed_steps, failed_steps, status, metadata, created_at)
            VALUES ($1, $2, $3, 0, 0, 'Pending', $4, now())
            "#,
        )
        .bind(join_id)
        .bind(grouping_key)
        .bind(expected_steps)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(join_id)
    }

    /// Idempotently binds `outbox_message_id` as a member of `join_id`
    ///.
    pub async fn attach(&self, join_id: Uuid, outbox_message_id: Uuid) -> relay_core::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO relay.outbox_join_member (join_id, outbox_message_id, status)
            VALUES ($1, $2, 'Pending')
            ON CONFLICT (join_id, outbox_message_id) DO NOTHING
            "#,
        )
        .bind(join_id)
        .bind(outbox_message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Manual recovery path alongside the automatic ack/fail advancement
    /// in `outbox.rs`; idempotent per `(joinId, outboxMessageId)`.
    pub async fn report_step_completed(
        &self,
        join_id: Uuid,
        outbox_message_id: Uuid,
    ) -> relay_core::Result<()> {
        self.report_step(join_id, outbox_message_id, JoinOutcome::Completed).await
    }

    pub async fn report_step_failed(
        &self,
        join_id: Uuid,
        outbox_message_id: Uuid,
    ) -> relay_core::Result<()> {
        self.report_step(join_id, outbox_message_id, JoinOutcome::Failed).await
    }

    async fn report_step(
        &self,
        join_id: Uuid,
        outbox_message_id: Uuid,
        outcome: JoinOutcome,
    ) -> relay_core::Result<()> {
        let row = sqlx::query(
            "SELECT 1 FROM relay.outbox_join_member WHERE join_id = $1 AND outbox_message_id = $2",
        )
        .bind(join_id)
        .bind(outbox_message_id)
        .fetch_optional(&self.pool)
        .await?;
        if row.is_none() {
            return Err(relay_core::Error::not_found(format!(
                "no join member for join {join_id} message {outbox_message_id}"
            )));
        }

        let mut tx = self.pool.begin().await?;
        advance_join_counters(&mut tx, &[outbox_message_id], outcome).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn snapshot(&self, join_id: Uuid) -> relay_core::Result<Option<JoinSnapshot>> {
        let row = sqlx::query(
            "SELECT expected_steps, completed_steps, failed_steps, status FROM relay.outbox_join WHERE join_id = $1",
        )
        .bind(join_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(JoinSnapshot {
            join_id,
            expected_steps: row.try_get("expected_steps")?,
            completed_steps: row.try_get("completed_steps")?,
            failed_steps: row.try_get("failed_steps")?,
            status: row.try_get("status")?,
        }))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JoinWaitPayload {
    pub join_id: Uuid,
    pub fail_if_any_step_failed: bool,
    pub on_complete_topic: String,
    #[serde(default)]
    pub on_complete_payload: Value,
    pub on_fail_topic: Option<String>,
    #[serde(default)]
    pub on_fail_payload: Value,
}

/// The built-in `join.wait` `OutboxHandler`. Registered by the
/// caller under the fixed topic `"join.wait"` alongside its own handlers.
pub struct JoinWaitHandler {
    pool: PgPool,
    outbox: OutboxStore,
}

impl JoinWaitHandler {
    pub fn new(pool: PgPool, outbox: OutboxStore) -> Self {
        Self { pool, outbox }
    }
}

#[async_trait::async_trait]
impl OutboxHandler for JoinWaitHandler {
    fn topic(&self) -> &str {
        "join.wait"
    }

    async fn handle(&self, message: &OutboxRow) -> anyhow::Result<HandlerOutcome> {
        let payload: JoinWaitPayload = serde_json::from_value(message.payload.clone())?;

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT expected_steps, completed_steps, failed_steps, status \
             FROM relay.outbox_join WHERE join_id = $1 FOR UPDATE",
        )
        .bind(payload.join_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            anyhow::bail!("join.wait: join {} not found", payload.join_id);
        };
        let expected: i32 = row.try_get("expected_steps")?;
        let completed: i32 = row.try_get("completed_steps")?;
        let failed: i32 = row.try_get("failed_steps")?;
        let status: String = row.try_get("status")?;

        if status == "Completed" || status == "Failed" {
            tx.commit().await?;
            return Ok(HandlerOutcome::Processed);
        }

        if completed + failed < expected {
            tx.rollback().await.ok();
            anyhow::bail!(
                "join.wait: join {} not yet complete ({}+{} of {})",
                payload.join_id,
                completed,
                failed,
                expected
            );
        }

        if failed > 0 && payload.fail_if_any_step_failed {
            sqlx::query("UPDATE relay.outbox_join SET status = 'Failed' WHERE join_id = $1")
                .bind(payload.join_id)
                .execute(&mut *tx)
                .await?;
            if let Some(on_fail_topic) = payload.on_fail_topic.as_deref() {
                let topic = Topic::new(on_fail_topic)?;
                self.outbox
                    .enqueue_in_tx(&mut tx, &topic, payload.on_fail_payload.clone(), None, None)
                    .await?;
            }
        } else {
            sqlx::query("UPDATE relay.outbox_join SET status = 'Completed' WHERE join_id = $1")
                .bind(payload.join_id)
                .execute(&mut *tx)
                .await?;
            let topic = Topic::new(payload.on_complete_topic.as_str())?;
            self.outbox
                .enqueue_in_tx(&mut tx, &topic, payload.on_complete_payload.clone(), None, None)
                .await?;
        }

        tx.commit().await?;
        Ok(HandlerOutcome::Processed)
    }
}

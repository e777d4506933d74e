//! Fanout: policy-driven expansion of one source Outbox row into multiple
//! destination rows, with a resumable cursor.
//!
//! Expansion idempotency is enforced by a `(source_id, destination_key)`
//! unique constraint on `relay.fanout_expansion`: re-running expansion
//! after a crash either finds the row already inserted (no-op) or inserts
//! it fresh, never both (testable property: "repeated expansion after
//! crash cannot produce duplicates beyond at-least-once").
//!
//! Cursor advancement itself is not fenced in SQL; validity rests on the
//! caller holding a current policy lease, which is an operational guarantee
//! the Fanout dispatcher loop provides by holding a `LeaseHandle` for the
//! policy's resource name across the read-expand-advance cycle and
//! checking `ensure_still_held()` before committing.

use crate::outbox::OutboxStore;
use chrono::{DateTime, Utc};
use relay_core::{Error, FanoutCursorRow, FanoutPolicyRow, OutboxRow, Result, Topic, WorkItemId};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct FanoutStore {
    pool: PgPool,
}

impl FanoutStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn register_policy(
        &self,
        policy_name: &str,
        source_topic: &str,
        destination_topics: &[String],
        is_enabled: bool,
    ) -> Result<()> {
        if destination_topics.is_empty() {
            return Err(Error::validation("fanout policy needs at least one destination"));
        }
        sqlx::query(
            r#"
            INSERT INTO relay.fanout_policy (policy_name, source_topic, destination_topics, is_enabled)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (policy_name) DO UPDATE SET
                source_topic = $2,
                destination_topics = $3,
                is_enabled = $4
            "#,
        )
        .bind(policy_name)
        .bind(source_topic)
        .bind(destination_topics)
        .bind(is_enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_enabled(&self) -> Result<Vec<FanoutPolicyRow>> {
        let rows = sqlx::query(
            "SELECT policy_name, source_topic, destination_topics, is_enabled FROM relay.fanout_policy WHERE is_enabled",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(FanoutPolicyRow {
                    policy_name: row.try_get("policy_name")?,
                    source_topic: row.try_get("source_topic")?,
                    destination_topics: row.try_get("destination_topics")?,
                    is_enabled: row.try_get("is_enabled")?,
                })
            })
            .collect()
    }

    /// Current cursor, defaulting to the Unix epoch (reads from the start
    /// of the source stream) when no cursor row exists yet.
    pub async fn cursor(&self, policy_name: &str) -> Result<FanoutCursorRow> {
        let row = sqlx::query(
            "SELECT policy_name, last_position, last_source_id FROM relay.fanout_cursor WHERE policy_name = $1",
        )
        .bind(policy_name)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(FanoutCursorRow {
                policy_name: policy_name.to_string(),
                last_position: DateTime::<Utc>::UNIX_EPOCH,
                last_source_id: None,
            });
        };
        Ok(FanoutCursorRow {
            policy_name: row.try_get("policy_name")?,
            last_position: row.try_get("last_position")?,
            last_source_id: row
                .try_get::<Option<Uuid>, _>("last_source_id")?
                .map(WorkItemId::from_uuid),
        })
    }

    /// Reads the next batch of source rows strictly after the cursor
    /// position, ordered so the cursor can advance monotonically.
    pub async fn next_source_batch(
        &self,
        source_topic: &str,
        cursor: &FanoutCursorRow,
        batch_size: i64,
    ) -> Result<Vec<OutboxRow>> {
        let last_id = cursor.last_source_id.map(|id| id.as_uuid());
        let rows = sqlx::query(
            r#"
            SELECT id, message_id, topic, payload, correlation_id, retry_count, created_at
            FROM relay.outbox
            WHERE topic = $1
              AND (created_at, id) > ($2, COALESCE($3, '00000000-0000-0000-0000-000000000000'::uuid))
            ORDER BY created_at, id
            LIMIT $4
            "#,
        )
        .bind(source_topic)
        .bind(cursor.last_position)
        .bind(last_id)
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(OutboxRow {
                    id: WorkItemId::from_uuid(row.try_get::<Uuid, _>("id")?),
                    message_id: relay_core::MessageId::from_uuid(row.try_get::<Uuid, _>("message_id")?),
                    topic: row.try_get("topic")?,
                    payload: row.try_get("payload")?,
                    correlation_id: row.try_get("correlation_id")?,
                    retry_count: row.try_get("retry_count")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Expands one source row into one destination topic, inside
    /// `tx`. Returns `true` if this call performed the insert, `false` if
    /// the `(source_id, destination)` pair had already been expanded
    /// (idempotent replay after crash).
    pub async fn expand_one(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        outbox: &OutboxStore,
        source: &OutboxRow,
        destination_topic: &str,
    ) -> Result<bool> {
        let claimed = sqlx::query(
            r#"
            INSERT INTO relay.fanout_expansion (source_id, destination_key)
            VALUES ($1, $2)
            ON CONFLICT (source_id, destination_key) DO NOTHING
            RETURNING 1
            "#,
        )
        .bind(source.id.as_uuid())
        .bind(destination_topic)
        .fetch_optional(&mut **tx)
        .await?;

        if claimed.is_none() {
            return Ok(false);
        }

        let topic = Topic::new(destination_topic)?;
        outbox
            .enqueue_in_tx(
                tx,
                &topic,
                source.payload.clone(),
                source.correlation_id.as_deref(),
                None,
            )
            .await?;
        Ok(true)
    }

    /// Advances the cursor to `(new_position, new_source_id)`. Caller must
    /// hold a current lease for the policy; this store
    /// does not itself verify the lease.
    pub async fn advance_cursor(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        policy_name: &str,
        new_position: DateTime<Utc>,
        new_source_id: WorkItemId,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO relay.fanout_cursor (policy_name, last_position, last_source_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (policy_name) DO UPDATE SET
                last_position = $2,
                last_source_id = $3
            "#,
        )
        .bind(policy_name)
        .bind(new_position)
        .bind(new_source_id.as_uuid())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

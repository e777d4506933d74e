//! Timers (one-shot) and recurring Jobs/JobRuns.
//!
//! Timers are a WorkItem table driven by `WorkQueueEngine` directly (the
//! table-specific eligibility predicate is just `due_time_utc <= now()`,
//! already built into the engine's claim statement). JobRuns are the same
//! shape; `Jobs` itself is not a WorkQueue table, it is the recurring
//! definition the dispatcher loop promotes into JobRuns.
//!
//! `SchedulerState` holds the single `current_fencing_token` column the
//! dispatch loop's step 1 compares against before promoting anything
//!.

use crate::workqueue::{WorkQueueEngine, JOB_RUNS_TABLE, TIMERS_TABLE};
use chrono::{DateTime, Utc};
use croner::Cron;
use relay_core::{Error, FencingToken, JobDefinition, JobRunRow, Result, TimerRow, WorkItemId};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Computes the next firing strictly after `after` for a 5- or 6-field cron
/// expression. Used both at `createOrUpdate` time
/// and to advance `next_due_time` once a job has fired.
pub fn next_fire_after(cron_schedule: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let cron = Cron::new(cron_schedule)
        .parse()
        .map_err(|e| Error::validation(format!("invalid cron schedule {cron_schedule:?}: {e}")))?;
    cron.find_next_occurrence(&after, false)
        .map_err(|e| Error::validation(format!("cron schedule {cron_schedule:?} has no next occurrence: {e}")))
}

#[derive(Debug, Clone)]
pub struct TimerStore {
    pool: PgPool,
    engine: WorkQueueEngine,
}

impl TimerStore {
    pub fn new(pool: PgPool) -> Self {
        let engine = WorkQueueEngine::new(pool.clone(), TIMERS_TABLE);
        Self { pool, engine }
    }

    /// Schedules a one-shot firing.
    pub async fn schedule_timer(
        &self,
        topic: &str,
        payload: Value,
        due_time_utc: DateTime<Utc>,
    ) -> Result<WorkItemId> {
        let id = WorkItemId::new();
        sqlx::query(
            r#"
            INSERT INTO relay.timers
                (id, topic, payload, due_time_utc, status, retry_count, created_at, next_attempt_at)
            VALUES ($1, $2, $3, $4, 0, 0, now(), now())
            "#,
        )
        .bind(id.as_uuid())
        .bind(topic)
        .bind(payload)
        .bind(due_time_utc)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Transitions `Pending -> Cancelled`, but only while the timer is
    /// still `Ready`. Returns whether the cancellation took effect.
    pub async fn cancel_timer(&self, id: WorkItemId) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE relay.timers
            SET status = 3, last_error = 'cancelled'
            WHERE id = $1 AND status = 0
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Claims due timers for promotion into the Outbox (scheduler
    /// dispatch loop step 3).
    pub async fn claim_due(
        &self,
        owner: relay_core::OwnerToken,
        lease_seconds: i64,
        batch_size: i64,
    ) -> Result<Vec<TimerRow>> {
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
                FROM relay.timers
                WHERE status = 0
                  AND (locked_until IS NULL OR locked_until <= now())
                  AND due_time_utc <= now()
                ORDER BY due_time_utc, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE relay.timers AS t
            SET status = 1,
                owner_token = $1,
                locked_until = now() + ($2::text || ' seconds')::interval
            FROM picked
            WHERE t.id = picked.id
            RETURNING t.id, t.topic, t.payload, t.due_time_utc
            "#,
        )
        .bind(owner.as_uuid())
        .bind(lease_seconds.to_string())
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(TimerRow {
                    id: WorkItemId::from_uuid(row.try_get::<Uuid, _>("id")?),
                    topic: row.try_get("topic")?,
                    payload: row.try_get("payload")?,
                    due_time_utc: row.try_get("due_time_utc")?,
                })
            })
            .collect()
    }

    pub async fn ack(&self, owner: relay_core::OwnerToken, ids: &[WorkItemId]) -> Result<u64> {
        self.engine.ack(owner, ids).await
    }

    pub async fn abandon(
        &self,
        owner: relay_core::OwnerToken,
        ids: &[WorkItemId],
        last_error: Option<&str>,
    ) -> Result<u64> {
        self.engine.abandon(owner, ids, last_error, None).await
    }

    pub async fn reap_expired(&self, batch_limit: i64) -> Result<u64> {
        self.engine.reap_expired(batch_limit).await
    }

    pub async fn delete_done_older_than(&self, retention: std::time::Duration, batch_limit: i64) -> Result<u64> {
        self.engine.delete_done_older_than(retention, batch_limit).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, Clone)]
pub struct JobStore {
    pool: PgPool,
    job_runs: WorkQueueEngine,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        let job_runs = WorkQueueEngine::new(pool.clone(), JOB_RUNS_TABLE);
        Self { pool, job_runs }
    }

    /// Upserts a job definition and recomputes `next_due_time` from
    /// `cron_schedule` relative to server now.
    pub async fn create_or_update(
        &self,
        job_name: &str,
        topic: &str,
        cron_schedule: &str,
        payload: Option<Value>,
    ) -> Result<()> {
        if job_name.is_empty() {
            return Err(Error::validation("jobName must be non-empty"));
        }
        let now: DateTime<Utc> = sqlx::query("SELECT now() AS now")
            .fetch_one(&self.pool)
            .await?
            .try_get("now")?;
        let next_due = next_fire_after(cron_schedule, now)?;

        sqlx::query(
            r#"
            INSERT INTO relay.jobs
                (job_name, cron_schedule, topic, payload, is_enabled, next_due_time, created_at)
            VALUES ($1, $2, $3, $4, true, $5, now())
            ON CONFLICT (job_name) DO UPDATE SET
                cron_schedule = $2,
                topic = $3,
                payload = COALESCE($4, relay.jobs.payload),
                is_enabled = true,
                next_due_time = $5
            "#,
        )
        .bind(job_name)
        .bind(cron_schedule)
        .bind(topic)
        .bind(payload)
        .bind(next_due)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes pending runs then the definition itself.
    pub async fn delete(&self, job_name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM relay.job_runs WHERE job_name = $1 AND status = 0")
            .bind(job_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM relay.jobs WHERE job_name = $1")
            .bind(job_name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Inserts a JobRun due immediately, independent of the cron schedule
    ///.
    pub async fn trigger(&self, job_name: &str) -> Result<WorkItemId> {
        let row = sqlx::query("SELECT topic, payload FROM relay.jobs WHERE job_name = $1")
            .bind(job_name)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Err(Error::not_found(format!("job {job_name} not found")));
        };
        let topic: String = row.try_get("topic")?;
        let payload: Value = row.try_get("payload")?;
        self.insert_job_run(job_name, &topic, payload).await
    }

    async fn insert_job_run(&self, job_name: &str, topic: &str, payload: Value) -> Result<WorkItemId> {
        let id = WorkItemId::new();
        sqlx::query(
            r#"
            INSERT INTO relay.job_runs
                (id, job_name, topic, payload, scheduled_time, status, retry_count, created_at, next_attempt_at)
            VALUES ($1, $2, $3, $4, now(), 0, 0, now(), now())
            "#,
        )
        .bind(id.as_uuid())
        .bind(job_name)
        .bind(topic)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Promotes every job whose `next_due_time <= now()` into a JobRun and
    /// advances its `next_due_time`, all in one transaction.
    pub async fn promote_due(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let due = sqlx::query(
            r#"
            SELECT job_name, cron_schedule, topic, payload
            FROM relay.jobs
            WHERE is_enabled AND next_due_time <= now()
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut promoted = 0u64;
        for row in due {
            let job_name: String = row.try_get("job_name")?;
            let cron_schedule: String = row.try_get("cron_schedule")?;
            let topic: String = row.try_get("topic")?;
            let payload: Value = row.try_get("payload")?;

            let id = WorkItemId::new();
            sqlx::query(
                r#"
                INSERT INTO relay.job_runs
                    (id, job_name, topic, payload, scheduled_time, status, retry_count, created_at, next_attempt_at)
                VALUES ($1, $2, $3, $4, now(), 0, 0, now(), now())
                "#,
            )
            .bind(id.as_uuid())
            .bind(&job_name)
            .bind(&topic)
            .bind(&payload)
            .execute(&mut *tx)
            .await?;

            let now: DateTime<Utc> = sqlx::query("SELECT now() AS now")
                .fetch_one(&mut *tx)
                .await?
                .try_get("now")?;
            let next_due = next_fire_after(&cron_schedule, now)?;
            sqlx::query("UPDATE relay.jobs SET next_due_time = $2 WHERE job_name = $1")
                .bind(&job_name)
                .bind(next_due)
                .execute(&mut *tx)
                .await?;
            promoted += 1;
        }

        tx.commit().await?;
        Ok(promoted)
    }

    pub async fn get(&self, job_name: &str) -> Result<Option<JobDefinition>> {
        let row = sqlx::query(
            "SELECT job_name, cron_schedule, topic, payload, is_enabled, next_due_time FROM relay.jobs WHERE job_name = $1",
        )
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(JobDefinition {
            job_name: row.try_get("job_name")?,
            cron_schedule: row.try_get("cron_schedule")?,
            topic: row.try_get("topic")?,
            payload: row.try_get("payload")?,
            is_enabled: row.try_get("is_enabled")?,
            next_due_time: row.try_get("next_due_time")?,
        }))
    }

    pub async fn claim_due_runs(
        &self,
        owner: relay_core::OwnerToken,
        lease_seconds: i64,
        batch_size: i64,
    ) -> Result<Vec<JobRunRow>> {
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
                FROM relay.job_runs
                WHERE status = 0
                  AND (locked_until IS NULL OR locked_until <= now())
                  AND scheduled_time <= now()
                ORDER BY scheduled_time, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE relay.job_runs AS t
            SET status = 1,
                owner_token = $1,
                locked_until = now() + ($2::text || ' seconds')::interval
            FROM picked
            WHERE t.id = picked.id
            RETURNING t.id, t.job_name, t.topic, t.payload, t.scheduled_time
            "#,
        )
        .bind(owner.as_uuid())
        .bind(lease_seconds.to_string())
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(JobRunRow {
                    id: WorkItemId::from_uuid(row.try_get::<Uuid, _>("id")?),
                    job_name: row.try_get("job_name")?,
                    topic: row.try_get("topic")?,
                    payload: row.try_get("payload")?,
                    scheduled_time: row.try_get("scheduled_time")?,
                })
            })
            .collect()
    }

    pub async fn ack_runs(&self, owner: relay_core::OwnerToken, ids: &[WorkItemId]) -> Result<u64> {
        self.job_runs.ack(owner, ids).await
    }

    pub async fn abandon_runs(
        &self,
        owner: relay_core::OwnerToken,
        ids: &[WorkItemId],
        last_error: Option<&str>,
    ) -> Result<u64> {
        self.job_runs.abandon(owner, ids, last_error, None).await
    }

    pub async fn reap_expired_runs(&self, batch_limit: i64) -> Result<u64> {
        self.job_runs.reap_expired(batch_limit).await
    }

    pub async fn delete_done_runs_older_than(&self, retention: std::time::Duration, batch_limit: i64) -> Result<u64> {
        self.job_runs.delete_done_older_than(retention, batch_limit).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// `SchedulerState.currentFencingToken` guarded update.
#[derive(Debug, Clone)]
pub struct SchedulerStateStore {
    pool: PgPool,
}

impl SchedulerStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Accepts `fencing` as the new `current_fencing_token` only if it is
    /// `>=` the stored value, returning whether it was accepted. A
    /// rejection means a newer lease holder has already advanced the
    /// state past this caller (stale lease, must stop promoting).
    pub async fn accept_fencing(&self, scheduler_name: &str, fencing: FencingToken) -> Result<bool> {
        let row = sqlx::query(
            r#"
            INSERT INTO relay.scheduler_state (scheduler_name, current_fencing_token)
            VALUES ($1, $2)
            ON CONFLICT (scheduler_name) DO UPDATE SET
                current_fencing_token = CASE
                    WHEN $2 >= relay.scheduler_state.current_fencing_token THEN $2
                    ELSE relay.scheduler_state.current_fencing_token
                END
            RETURNING (current_fencing_token = $2) AS accepted
            "#,
        )
        .bind(scheduler_name)
        .bind(fencing.value())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("accepted")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn next_fire_after_five_field_minutely() {
        let after = at(2026, 7, 28, 10, 15, 30);
        let next = next_fire_after("*/5 * * * *", after).unwrap();
        assert_eq!(next, at(2026, 7, 28, 10, 20, 0));
    }

    #[test]
    fn next_fire_after_crosses_day_boundary() {
        let after = at(2026, 7, 28, 23, 59, 0);
        let next = next_fire_after("0 0 * * *", after).unwrap();
        assert_eq!(next, at(2026, 7, 29, 0, 0, 0));
    }

    #[test]
    fn next_fire_after_six_field_seconds() {
        let after = at(2026, 7, 28, 10, 0, 0);
        let next = next_fire_after("0 * * * * *", after).unwrap();
        assert_eq!(next, at(2026, 7, 28, 10, 1, 0));
    }

    #[test]
    fn next_fire_after_rejects_invalid_expression() {
        let after = at(2026, 7, 28, 10, 0, 0);
        assert!(next_fire_after("not a cron", after).is_err());
    }
}

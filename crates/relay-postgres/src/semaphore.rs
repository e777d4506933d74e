//! Distributed semaphore: bounded concurrent holders with fencing and a
//! reaper for expired leases.
//!
//! `try_acquire` follows the same fence-then-claim shape as this crate's
//! other claim paths: a row-locking `SELECT ... FOR UPDATE` followed by a
//! conditional `UPDATE`/`INSERT`, all inside one transaction so the holder
//! count check and the insert are atomic.

use chrono::{DateTime, Utc};
use relay_core::{
    Error, FencingToken, OwnerToken, ResourceName, Result, SemaphoreAcquireOutcome, SemaphoreLimits,
};
use sqlx::{PgPool, Row};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SemaphoreStore {
    pool: PgPool,
    limits: SemaphoreLimits,
}

impl SemaphoreStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_limits(pool, SemaphoreLimits::default())
    }

    /// Enforces `ttl ∈ [minTtl, maxTtl]`, `limit ∈ [1, maxLimit]`
    /// bounds on every `ensure_exists`/`try_acquire` call.
    pub fn with_limits(pool: PgPool, limits: SemaphoreLimits) -> Self {
        Self { pool, limits }
    }

    /// Declares a semaphore with `max_count` permits if it does not already
    /// exist. Re-declaring with a different `max_count` is rejected.
    pub async fn ensure_exists(&self, name: &str, max_count: i32) -> Result<()> {
        ResourceName::new(name)?;
        self.limits.validate_limit(max_count)?;
        let row = sqlx::query(
            r#"
            INSERT INTO relay.semaphore (name, max_count)
            VALUES ($1, $2)
            ON CONFLICT (name) DO NOTHING
            RETURNING max_count
            "#,
        )
        .bind(name)
        .bind(max_count)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_some() {
            return Ok(());
        }

        let existing: i32 = sqlx::query("SELECT max_count FROM relay.semaphore WHERE name = $1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?
            .try_get("max_count")?;

        if existing != max_count {
            return Err(Error::configuration(format!(
                "semaphore {name} already declared with max_count {existing}, got {max_count}"
            )));
        }
        Ok(())
    }

    /// Grants a permit iff fewer than `max_count` unexpired leases are
    /// currently held, or the caller's own prior lease on this semaphore
    /// has expired and is being replaced.
    ///
    /// `client_request_id`, when supplied, makes the call idempotent: a
    /// second `try_acquire` with the same id while the first lease is
    /// still active returns that same lease's token/fencing instead of
    /// granting (or refusing) a second one).
    pub async fn try_acquire(
        &self,
        name: &str,
        owner: OwnerToken,
        duration: Duration,
        client_request_id: Option<&str>,
    ) -> Result<SemaphoreAcquireOutcome> {
        self.limits.validate_ttl(duration)?;
        let mut tx = self.pool.begin().await?;

        let sem = sqlx::query("SELECT max_count FROM relay.semaphore WHERE name = $1 FOR UPDATE")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(sem) = sem else {
            return Ok(SemaphoreAcquireOutcome::NotFound);
        };
        let max_count: i32 = sem.try_get("max_count")?;

        sqlx::query(
            r#"
            DELETE FROM relay.semaphore_lease
            WHERE semaphore_name = $1 AND lease_until <= now()
            "#,
        )
        .bind(name)
        .execute(&mut *tx)
        .await?;

        if let Some(client_request_id) = client_request_id {
            let existing = sqlx::query(
                r#"
                SELECT owner_token, fencing_token, lease_until
                FROM relay.semaphore_lease
                WHERE semaphore_name = $1 AND client_request_id = $2 AND lease_until > now()
                "#,
            )
            .bind(name)
            .bind(client_request_id)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(existing) = existing {
                tx.commit().await?;
                return Ok(SemaphoreAcquireOutcome::Acquired {
                    token: OwnerToken::from_uuid(existing.try_get("owner_token")?),
                    fencing: FencingToken::new(existing.try_get("fencing_token")?),
                    lease_until_utc: existing.try_get("lease_until")?,
                });
            }
        }

        let held: i64 = sqlx::query(
            "SELECT count(*) AS n FROM relay.semaphore_lease WHERE semaphore_name = $1",
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await?
        .try_get("n")?;

        if held >= max_count as i64 {
            tx.commit().await?;
            return Ok(SemaphoreAcquireOutcome::NotAcquired);
        }

        let fencing: i64 = sqlx::query(
            r#"
            UPDATE relay.semaphore
            SET fencing_token = fencing_token + 1
            WHERE name = $1
            RETURNING fencing_token
            "#,
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await?
        .try_get("fencing_token")?;

        let lease_until: DateTime<Utc> = sqlx::query(
            r#"
            INSERT INTO relay.semaphore_lease
                (semaphore_name, owner_token, fencing_token, lease_until, client_request_id)
            VALUES ($1, $2, $3, now() + ($4::text || ' seconds')::interval, $5)
            RETURNING lease_until
            "#,
        )
        .bind(name)
        .bind(owner.as_uuid())
        .bind(fencing)
        .bind(duration.as_secs().to_string())
        .bind(client_request_id)
        .fetch_one(&mut *tx)
        .await?
        .try_get("lease_until")?;

        tx.commit().await?;

        Ok(SemaphoreAcquireOutcome::Acquired {
            token: owner,
            fencing: FencingToken::new(fencing),
            lease_until_utc: lease_until,
        })
    }

    /// Extends an active lease iff `owner` and `fencing` still match the
    /// stored row.
    pub async fn renew(
        &self,
        name: &str,
        owner: OwnerToken,
        fencing: FencingToken,
        duration: Duration,
    ) -> Result<bool> {
        self.limits.validate_ttl(duration)?;
        let res = sqlx::query(
            r#"
            UPDATE relay.semaphore_lease
            SET lease_until = now() + ($4::text || ' seconds')::interval
            WHERE semaphore_name = $1
              AND owner_token = $2
              AND fencing_token = $3
              AND lease_until > now()
            "#,
        )
        .bind(name)
        .bind(owner.as_uuid())
        .bind(fencing.value())
        .bind(duration.as_secs().to_string())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Releases a held permit. Best-effort: a mismatched or already-expired
    /// lease is simply not found, no error.
    pub async fn release(&self, name: &str, owner: OwnerToken, fencing: FencingToken) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM relay.semaphore_lease
            WHERE semaphore_name = $1 AND owner_token = $2 AND fencing_token = $3
            "#,
        )
        .bind(name)
        .bind(owner.as_uuid())
        .bind(fencing.value())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes expired leases across every semaphore, freeing permits for
    /// other waiters. Run on a fixed interval by the
    /// dispatcher alongside the lease reaper.
    pub async fn reap_expired(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM relay.semaphore_lease WHERE lease_until <= now()")
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

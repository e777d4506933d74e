//! Distributed lease with DB-authoritative expiry and fencing.
//!
//! The acquire/renew statements follow the same fencing pattern used
//! throughout this crate's claim paths (lease token + attempt counter gated
//! by `FOR UPDATE`), generalized to a named resource instead of a single
//! work item.

use chrono::{DateTime, Utc};
use rand::Rng;
use relay_core::{Error, FencingToken, LeaseGrant, MonotonicClock, OwnerToken, Result};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
pub struct RenewResult {
    pub renewed: bool,
    pub lease_until_utc: Option<DateTime<Utc>>,
    pub server_now_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LeaseStore {
    pool: PgPool,
}

impl LeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Acquires iff there is no current holder, or the requester already
    /// holds it. Bumps the fencing counter only when ownership changes
    ///.
    pub async fn acquire(
        &self,
        name: &str,
        owner: OwnerToken,
        duration: Duration,
    ) -> Result<LeaseGrant> {
        let row = sqlx::query(
            r#"
            INSERT INTO relay.lease (resource_name, owner_token, lease_until, fencing_token, version)
            VALUES ($1, $2, now() + ($3::text || ' seconds')::interval, 1, 1)
            ON CONFLICT (resource_name) DO UPDATE SET
                owner_token = CASE
                    WHEN relay.lease.lease_until IS NULL OR relay.lease.lease_until <= now() OR relay.lease.owner_token = $2
                    THEN $2
                    ELSE relay.lease.owner_token
                END,
                lease_until = CASE
                    WHEN relay.lease.lease_until IS NULL OR relay.lease.lease_until <= now() OR relay.lease.owner_token = $2
                    THEN now() + ($3::text || ' seconds')::interval
                    ELSE relay.lease.lease_until
                END,
                fencing_token = CASE
                    WHEN (relay.lease.lease_until IS NULL OR relay.lease.lease_until <= now())
                         AND relay.lease.owner_token IS DISTINCT FROM $2
                    THEN relay.lease.fencing_token + 1
                    ELSE relay.lease.fencing_token
                END,
                version = relay.lease.version + 1
            RETURNING owner_token, lease_until, fencing_token, (owner_token = $2) AS acquired, now() AS server_now
            "#,
        )
        .bind(name)
        .bind(owner.as_uuid())
        .bind(duration.as_secs().to_string())
        .fetch_one(&self.pool)
        .await?;

        let acquired: bool = row.try_get("acquired")?;
        let server_now: DateTime<Utc> = row.try_get("server_now")?;
        if !acquired {
            return Ok(LeaseGrant {
                acquired: false,
                lease_until_utc: None,
                fencing_token: None,
                server_now_utc: server_now,
            });
        }

        let fencing_raw: i64 = row.try_get("fencing_token")?;
        Ok(LeaseGrant {
            acquired: true,
            lease_until_utc: row.try_get("lease_until")?,
            fencing_token: Some(FencingToken::new(fencing_raw)),
            server_now_utc: server_now,
        })
    }

    /// Extends `lease_until` iff `owner` currently holds an unexpired
    /// lease. Returns `renewed: false` (never an error) when the caller has
    /// lost the lease — the caller must treat that as lease loss.
    pub async fn renew(
        &self,
        name: &str,
        owner: OwnerToken,
        duration: Duration,
    ) -> Result<RenewResult> {
        let row = sqlx::query(
            r#"
            UPDATE relay.lease
            SET lease_until = now() + ($3::text || ' seconds')::interval,
                version = version + 1
            WHERE resource_name = $1
              AND owner_token = $2
              AND lease_until > now()
            RETURNING lease_until
            "#,
        )
        .bind(name)
        .bind(owner.as_uuid())
        .bind(duration.as_secs().to_string())
        .fetch_optional(&self.pool)
        .await?;

        let server_now = sqlx::query("SELECT now() AS now")
            .fetch_one(&self.pool)
            .await?
            .try_get::<DateTime<Utc>, _>("now")?;

        match row {
            Some(row) => Ok(RenewResult {
                renewed: true,
                lease_until_utc: row.try_get("lease_until")?,
                server_now_utc: server_now,
            }),
            None => Ok(RenewResult {
                renewed: false,
                lease_until_utc: None,
                server_now_utc: server_now,
            }),
        }
    }

    /// Clears ownership iff `owner` matches. Never errors on mismatch —
    /// release is best-effort cleanup.
    pub async fn release(&self, name: &str, owner: OwnerToken) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE relay.lease
            SET owner_token = NULL, lease_until = NULL
            WHERE resource_name = $1 AND owner_token = $2
            "#,
        )
        .bind(name)
        .bind(owner.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// High-level lease holder that auto-renews on a monotonic-clock schedule
/// and exposes a lease-scoped cancellation signal on loss.
pub struct LeaseHandle {
    name: String,
    owner: OwnerToken,
    lost_rx: watch::Receiver<bool>,
    _renew_task: tokio::task::JoinHandle<()>,
}

impl LeaseHandle {
    /// Acquires `name` then spawns a background renewal loop that wakes at
    /// `renew_percent * duration` (default 0.6) with +/-50% jitter.
    /// Returns `None` if the initial acquire fails.
    pub async fn acquire(
        store: Arc<LeaseStore>,
        clock: Arc<dyn MonotonicClock>,
        name: impl Into<String>,
        owner: OwnerToken,
        duration: Duration,
    ) -> Result<Option<Self>> {
        let name = name.into();
        let grant = store.acquire(&name, owner, duration).await?;
        if !grant.acquired {
            return Ok(None);
        }

        let (lost_tx, lost_rx) = watch::channel(false);
        let task_name = name.clone();
        let renew_task = tokio::spawn(renew_loop(
            store,
            clock,
            task_name,
            owner,
            duration,
            lost_tx,
        ));

        Ok(Some(Self {
            name,
            owner,
            lost_rx,
            _renew_task: renew_task,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> OwnerToken {
        self.owner
    }

    /// Fails fast if the background renewal loop has already observed
    /// lease loss.
    pub fn ensure_still_held(&self) -> Result<()> {
        if *self.lost_rx.borrow() {
            return Err(Error::lost_lease(format!("lease {} lost", self.name)));
        }
        Ok(())
    }

    pub fn lost_signal(&self) -> watch::Receiver<bool> {
        self.lost_rx.clone()
    }
}

async fn renew_loop(
    store: Arc<LeaseStore>,
    clock: Arc<dyn MonotonicClock>,
    name: String,
    owner: OwnerToken,
    duration: Duration,
    lost_tx: watch::Sender<bool>,
) {
    const RENEW_PERCENT: f64 = 0.6;
    loop {
        let cycle_started = clock.now_seconds();
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = duration.as_secs_f64() * RENEW_PERCENT * jitter;
        tokio::time::sleep(Duration::from_secs_f64(delay.max(0.05))).await;
        tracing::trace!(
            resource = %name,
            elapsed_s = clock.now_seconds() - cycle_started,
            "lease renewal cycle waking"
        );

        let mut consecutive_failures = 0;
        loop {
            match store.renew(&name, owner, duration).await {
                Ok(result) if result.renewed => break,
                Ok(_) => {
                    tracing::warn!(resource = %name, "lease renewal rejected; lease lost");
                    let _ = lost_tx.send(true);
                    return;
                }
                Err(err) => {
                    consecutive_failures += 1;
                    tracing::warn!(resource = %name, error = %err, attempt = consecutive_failures, "transient error renewing lease");
                    if consecutive_failures >= 2 {
                        let _ = lost_tx.send(true);
                        return;
                    }
                }
            }
        }

        if *lost_tx.borrow() {
            return;
        }
    }
}

//! Scheduler dispatch loop: promotes due timers/jobs into the Outbox,
//! lease-gated.
//!
//! Each iteration: (1) verify the per-store scheduler
//! lease is still held and that its fencing token has not gone backwards,
//! (2) bulk-promote due jobs into JobRuns, (3) claim due timers and
//! Outbox-enqueue them, (4) claim due JobRuns and Outbox-enqueue them, (5)
//! sleep until the next tick. Any lease loss observed mid-iteration aborts
//! the remainder of that iteration.

use relay_core::{Error, MonotonicClock, OwnerToken, Result, Topic};
use relay_postgres::{JobStore, LeaseHandle, LeaseStore, OutboxStore, SchedulerStateStore, TimerStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct SchedulerDispatcherConfig {
    /// Resource name the scheduler lease is acquired under, e.g.
    /// `"scheduler:{store_id}"`.
    pub lease_name: String,
    pub lease_duration: Duration,
    pub lease_seconds: i64,
    pub batch_size: i64,
    pub poll_interval: Duration,
}

pub struct SchedulerDispatcher {
    lease_store: Arc<LeaseStore>,
    state_store: SchedulerStateStore,
    job_store: JobStore,
    timer_store: TimerStore,
    outbox: OutboxStore,
    clock: Arc<dyn MonotonicClock>,
    cfg: SchedulerDispatcherConfig,
}

impl SchedulerDispatcher {
    pub fn new(
        lease_store: Arc<LeaseStore>,
        state_store: SchedulerStateStore,
        job_store: JobStore,
        timer_store: TimerStore,
        outbox: OutboxStore,
        clock: Arc<dyn MonotonicClock>,
        cfg: SchedulerDispatcherConfig,
    ) -> Self {
        Self {
            lease_store,
            state_store,
            job_store,
            timer_store,
            outbox,
            clock,
            cfg,
        }
    }

    /// Runs until `shutdown` reports `true`. Each iteration re-acquires
    /// the scheduler lease if not already held by this process.
    pub async fn run_loop(&self, owner: OwnerToken, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            let lease = LeaseHandle::acquire(
                self.lease_store.clone(),
                self.clock.clone(),
                self.cfg.lease_name.clone(),
                owner,
                self.cfg.lease_duration,
            )
            .await;

            match lease {
                Ok(Some(lease)) => {
                    if let Err(err) = self.run_iteration(&lease, owner).await {
                        tracing::warn!(event = "relay.scheduler.iteration_error", error = %err);
                    }
                }
                Ok(None) => {
                    tracing::debug!(event = "relay.scheduler.lease_held_elsewhere", lease = %self.cfg.lease_name);
                }
                Err(err) => {
                    tracing::warn!(event = "relay.scheduler.acquire_error", error = %err);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn run_iteration(&self, lease: &LeaseHandle, owner: OwnerToken) -> Result<()> {
        lease.ensure_still_held()?;

        let grant = self
            .lease_store
            .acquire(lease.name(), lease.owner(), self.cfg.lease_duration)
            .await?;
        let Some(fencing) = grant.fencing_token else {
            return Err(Error::lost_lease(format!("no fencing token for {}", lease.name())));
        };
        if !self.state_store.accept_fencing(&self.cfg.lease_name, fencing).await? {
            return Err(Error::lost_lease(format!(
                "scheduler fencing {} rejected; a newer holder is active",
                fencing
            )));
        }

        lease.ensure_still_held()?;
        let promoted = self.job_store.promote_due().await?;
        if promoted > 0 {
            tracing::info!(event = "relay.scheduler.jobs_promoted", count = promoted);
        }

        lease.ensure_still_held()?;
        let due_timers = self
            .timer_store
            .claim_due(owner, self.cfg.lease_seconds, self.cfg.batch_size)
            .await?;
        for timer in &due_timers {
            lease.ensure_still_held()?;
            let topic = Topic::new(timer.topic.clone())?;
            self.outbox
                .enqueue(&topic, timer.payload.clone(), Some(&timer.id.to_string()), None)
                .await?;
            self.timer_store.ack(owner, &[timer.id]).await?;
        }

        lease.ensure_still_held()?;
        let due_runs = self
            .job_store
            .claim_due_runs(owner, self.cfg.lease_seconds, self.cfg.batch_size)
            .await?;
        for run in &due_runs {
            lease.ensure_still_held()?;
            let topic = Topic::new(run.topic.clone())?;
            self.outbox
                .enqueue(&topic, run.payload.clone(), Some(&run.id.to_string()), None)
                .await?;
            self.job_store.ack_runs(owner, &[run.id]).await?;
        }

        Ok(())
    }
}

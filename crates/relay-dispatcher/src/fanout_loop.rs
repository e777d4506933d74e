//! Fanout dispatch loop: expands one source Outbox row into multiple
//! destination rows under a policy-scoped lease.

use relay_core::{MonotonicClock, OwnerToken, Result};
use relay_postgres::{FanoutStore, LeaseHandle, LeaseStore, OutboxStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct FanoutDispatcherConfig {
    pub lease_duration: Duration,
    pub batch_size: i64,
    pub poll_interval: Duration,
}

pub struct FanoutDispatcher {
    lease_store: Arc<LeaseStore>,
    fanout: FanoutStore,
    outbox: OutboxStore,
    clock: Arc<dyn MonotonicClock>,
    cfg: FanoutDispatcherConfig,
}

impl FanoutDispatcher {
    pub fn new(
        lease_store: Arc<LeaseStore>,
        fanout: FanoutStore,
        outbox: OutboxStore,
        clock: Arc<dyn MonotonicClock>,
        cfg: FanoutDispatcherConfig,
    ) -> Self {
        Self {
            lease_store,
            fanout,
            outbox,
            clock,
            cfg,
        }
    }

    pub async fn run_loop(&self, owner: OwnerToken, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            match self.fanout.list_enabled().await {
                Ok(policies) => {
                    for policy in policies {
                        if let Err(err) = self.run_policy_once(owner, &policy.policy_name).await {
                            tracing::warn!(
                                event = "relay.fanout.policy_error",
                                policy = %policy.policy_name,
                                error = %err,
                            );
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(event = "relay.fanout.list_error", error = %err);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Drains the policy's source backlog one lease-held batch at a time,
    /// returning once the batch comes back empty.
    async fn run_policy_once(&self, owner: OwnerToken, policy_name: &str) -> Result<()> {
        let lease_name = format!("fanout:{policy_name}");
        let Some(lease) = LeaseHandle::acquire(
            self.lease_store.clone(),
            self.clock.clone(),
            lease_name,
            owner,
            self.cfg.lease_duration,
        )
        .await?
        else {
            return Ok(());
        };

        loop {
            lease.ensure_still_held()?;

            let Some(policy) = self
                .fanout
                .list_enabled()
                .await?
                .into_iter()
                .find(|p| p.policy_name == policy_name)
            else {
                return Ok(());
            };

            let cursor = self.fanout.cursor(policy_name).await?;
            let batch = self
                .fanout
                .next_source_batch(&policy.source_topic, &cursor, self.cfg.batch_size)
                .await?;
            if batch.is_empty() {
                return Ok(());
            }

            let mut tx = self.outbox.pool().begin().await?;
            let mut last = (cursor.last_position, cursor.last_source_id);
            for source in &batch {
                for destination in &policy.destination_topics {
                    self.fanout
                        .expand_one(&mut tx, &self.outbox, source, destination)
                        .await?;
                }
                last = (source.created_at, Some(source.id));
            }
            if let (position, Some(id)) = last {
                self.fanout.advance_cursor(&mut tx, policy_name, position, id).await?;
            }
            lease.ensure_still_held()?;
            tx.commit().await?;

            tracing::info!(
                event = "relay.fanout.expanded",
                policy = %policy_name,
                rows = batch.len(),
            );

            if batch.len() < self.cfg.batch_size as usize {
                return Ok(());
            }
        }
    }
}

//! The Outbox poll-claim-dispatch-ack/abandon/fail loop.
//!
//! Join-counter advancement on ack/fail is already inside
//! `relay_postgres::OutboxStore`; this loop only owns
//! handler resolution, the abandon-vs-fail ceiling decision, and the empty-claim backoff.

use relay_core::{BackoffPolicy, HandlerOutcome, OutboxHandlerRegistry, OwnerToken, Result};
use relay_postgres::{workqueue, OutboxStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
pub struct OutboxDispatchConfig {
    pub lease_seconds: i64,
    pub batch_size: i64,
}

impl Default for OutboxDispatchConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 30,
            batch_size: 50,
        }
    }
}

pub struct OutboxDispatcher {
    store: OutboxStore,
    handlers: Arc<OutboxHandlerRegistry>,
    backoff: BackoffPolicy,
    cfg: OutboxDispatchConfig,
}

impl OutboxDispatcher {
    pub fn new(
        store: OutboxStore,
        handlers: Arc<OutboxHandlerRegistry>,
        backoff: BackoffPolicy,
        cfg: OutboxDispatchConfig,
    ) -> Self {
        Self {
            store,
            handlers,
            backoff,
            cfg,
        }
    }

    /// Claims one batch and dispatches it to completion. Returns the
    /// number of rows claimed (0 means the caller should back off).
    pub async fn run_once(&self, owner: OwnerToken) -> Result<usize> {
        let rows = self
            .store
            .claim(owner, self.cfg.lease_seconds, self.cfg.batch_size)
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }

        for row in &rows {
            let Some(handler) = self.handlers.resolve(&row.topic) else {
                tracing::warn!(
                    event = "relay.outbox.no_handler",
                    topic = %row.topic,
                    id = %row.id,
                    "no handler registered for topic; abandoning"
                );
                self.abandon_or_fail(owner, row, None).await?;
                continue;
            };

            match handler.handle(row).await {
                Ok(HandlerOutcome::Processed) => {
                    let acked = self.store.ack(owner, &[row.id]).await?;
                    tracing::info!(
                        event = "relay.outbox.acked",
                        topic = %row.topic,
                        id = %row.id,
                        acked,
                    );
                }
                Ok(HandlerOutcome::Dead) => {
                    self.store.fail(owner, &[row.id], Some("handler marked dead")).await?;
                    tracing::warn!(event = "relay.outbox.dead", topic = %row.topic, id = %row.id);
                }
                Err(err) => {
                    tracing::warn!(
                        event = "relay.outbox.handler_error",
                        topic = %row.topic,
                        id = %row.id,
                        error = %err,
                    );
                    self.abandon_or_fail(owner, row, Some(&err.to_string())).await?;
                }
            }
        }

        Ok(rows.len())
    }

    async fn abandon_or_fail(
        &self,
        owner: OwnerToken,
        row: &relay_core::OutboxRow,
        last_error: Option<&str>,
    ) -> Result<()> {
        if workqueue::exceeds_retry_ceiling(row.retry_count + 1, self.backoff.retry_ceiling) {
            self.store
                .fail(owner, &[row.id], last_error.or(Some("retry ceiling exceeded")))
                .await?;
        } else {
            let delay = self.backoff.retry_delay(row.retry_count + 1);
            self.store.abandon(owner, &[row.id], last_error, Some(delay)).await?;
        }
        Ok(())
    }

    /// Runs until `shutdown` reports `true`, backing off exponentially on
    /// empty claims.
    pub async fn run_loop(&self, owner: OwnerToken, mut shutdown: watch::Receiver<bool>) {
        let mut consecutive_empty = 0u32;
        while !*shutdown.borrow() {
            match self.run_once(owner).await {
                Ok(0) => {
                    consecutive_empty += 1;
                    let delay = self.backoff.poll_delay(consecutive_empty);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(_) => {
                    consecutive_empty = 0;
                }
                Err(err) => {
                    tracing::error!(event = "relay.outbox.loop_error", error = %err);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }
}

//! The Inbox poll-claim-dispatch-ack/abandon/fail loop.
//!
//! Same lifecycle as `outbox_loop`, minus join semantics: Inbox rows are
//! never join members.

use relay_core::{BackoffPolicy, HandlerOutcome, InboxHandlerRegistry, OwnerToken, Result};
use relay_postgres::{workqueue, InboxStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub use crate::outbox_loop::OutboxDispatchConfig as InboxDispatchConfig;

pub struct InboxDispatcher {
    store: InboxStore,
    handlers: Arc<InboxHandlerRegistry>,
    backoff: BackoffPolicy,
    cfg: InboxDispatchConfig,
}

impl InboxDispatcher {
    pub fn new(
        store: InboxStore,
        handlers: Arc<InboxHandlerRegistry>,
        backoff: BackoffPolicy,
        cfg: InboxDispatchConfig,
    ) -> Self {
        Self {
            store,
            handlers,
            backoff,
            cfg,
        }
    }

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
                    event = "relay.inbox.no_handler",
                    topic = %row.topic,
                    id = %row.id,
                    "no handler registered for topic; abandoning"
                );
                self.abandon_or_fail(owner, row, None).await?;
                continue;
            };

            match handler.handle(row).await {
                Ok(HandlerOutcome::Processed) => {
                    self.store.ack(owner, &[row.id]).await?;
                }
                Ok(HandlerOutcome::Dead) => {
                    self.store.fail(owner, &[row.id], Some("handler marked dead")).await?;
                }
                Err(err) => {
                    tracing::warn!(
                        event = "relay.inbox.handler_error",
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
        row: &relay_core::InboxRow,
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
                    tracing::error!(event = "relay.inbox.loop_error", error = %err);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }
}

//! Demo handler registrations for the `run` subcommand.
//!
//! A real deployment registers its own `OutboxHandler`/`InboxHandler`
//! implementations; these exist so `relay-harness run` and `demo-enqueue`
//! exercise a visible end-to-end path without a collaborator crate.

use async_trait::async_trait;
use relay_core::{HandlerOutcome, InboxHandler, InboxRow, OutboxHandler, OutboxRow};

/// Logs and acknowledges every message on `demo.echo`.
pub struct EchoOutboxHandler;

#[async_trait]
impl OutboxHandler for EchoOutboxHandler {
    fn topic(&self) -> &str {
        "demo.echo"
    }

    async fn handle(&self, message: &OutboxRow) -> anyhow::Result<HandlerOutcome> {
        tracing::info!(
            event = "relay.demo.echo",
            id = %message.id,
            payload = %message.payload,
        );
        Ok(HandlerOutcome::Processed)
    }
}

/// Logs and acknowledges every record on `demo.inbound`.
pub struct EchoInboxHandler;

#[async_trait]
impl InboxHandler for EchoInboxHandler {
    fn topic(&self) -> &str {
        "demo.inbound"
    }

    async fn handle(&self, record: &InboxRow) -> anyhow::Result<HandlerOutcome> {
        tracing::info!(
            event = "relay.demo.inbound",
            message_id = %record.message_id,
            source = %record.source,
            payload = %record.payload,
        );
        Ok(HandlerOutcome::Processed)
    }
}

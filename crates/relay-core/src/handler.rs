//! Handler registry contracts.
//!
//! A handler is a trait object behind a topic string; registries are
//! built once at startup and frozen before the first poll.

use crate::model::{InboxRow, OutboxRow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// What a handler invocation decided to do with the row.
///
/// The dispatcher converts a handler `Err` into `Retry` automatically; a
/// handler only needs to return `Dead` explicitly when it recognizes the
/// payload as permanently unprocessable and wants to skip the retry ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Processed,
    Dead,
}

#[async_trait]
pub trait OutboxHandler: Send + Sync {
    /// Exact, case-sensitive topic this handler serves.
    fn topic(&self) -> &str;

    async fn handle(&self, message: &OutboxRow) -> anyhow::Result<HandlerOutcome>;
}

#[async_trait]
pub trait InboxHandler: Send + Sync {
    fn topic(&self) -> &str;

    async fn handle(&self, record: &InboxRow) -> anyhow::Result<HandlerOutcome>;
}

/// Frozen topic → handler mapping. Built once via `OutboxHandlerRegistry::new`
/// and shared (`Arc`) across dispatcher tasks.
#[derive(Clone)]
pub struct OutboxHandlerRegistry {
    handlers: HashMap<String, Arc<dyn OutboxHandler>>,
}

impl OutboxHandlerRegistry {
    pub fn new(handlers: Vec<Arc<dyn OutboxHandler>>) -> anyhow::Result<Self> {
        let mut map = HashMap::with_capacity(handlers.len());
        for handler in handlers {
            let topic = handler.topic().to_string();
            if map.insert(topic.clone(), handler).is_some() {
                anyhow::bail!("duplicate outbox handler registration for topic {topic}");
            }
        }
        Ok(Self { handlers: map })
    }

    pub fn resolve(&self, topic: &str) -> Option<&Arc<dyn OutboxHandler>> {
        self.handlers.get(topic)
    }
}

#[derive(Clone)]
pub struct InboxHandlerRegistry {
    handlers: HashMap<String, Arc<dyn InboxHandler>>,
}

impl InboxHandlerRegistry {
    pub fn new(handlers: Vec<Arc<dyn InboxHandler>>) -> anyhow::Result<Self> {
        let mut map = HashMap::with_capacity(handlers.len());
        for handler in handlers {
            let topic = handler.topic().to_string();
            if map.insert(topic.clone(), handler).is_some() {
                anyhow::bail!("duplicate inbox handler registration for topic {topic}");
            }
        }
        Ok(Self { handlers: map })
    }

    pub fn resolve(&self, topic: &str) -> Option<&Arc<dyn InboxHandler>> {
        self.handlers.get(topic)
    }
}

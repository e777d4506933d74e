//! Write-path routing: map a routing key to the store that owns it.
//!
//! Generic over the writer type so both a plain `OutboxStore` and a
//! richer per-tenant writer facade can be routed without this module
//! depending on `relay-postgres` concretely.

use relay_core::{Error, Result};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Router<W> {
    writers: HashMap<String, W>,
}

impl<W: Clone> Router<W> {
    pub fn new(writers: HashMap<String, W>) -> Self {
        Self { writers }
    }

    /// Returns the writer registered for `routing_key`. Fails loudly
    /// rather than silently
    /// routing to a default store.
    pub fn resolve(&self, routing_key: &str) -> Result<W> {
        self.writers
            .get(routing_key)
            .cloned()
            .ok_or_else(|| Error::configuration(format!("no store routed for key {routing_key:?}")))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.writers.keys().map(String::as_str)
    }
}

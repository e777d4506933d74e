//! `StoreDiscovery` sourced from a fixed connection-string list.
//!
//! A real deployment would discover tenant databases from a control-plane
//! table or service registry; this harness only knows `STORE_URLS`, so
//! `discover` returns that same list every refresh.

use async_trait::async_trait;
use relay_dispatcher::{DiscoveredStoreConfig, StoreDiscovery};

pub struct StaticStoreDiscovery {
    stores: Vec<(String, String)>,
}

impl StaticStoreDiscovery {
    /// `primary` is included alongside every `extra` connection string so
    /// `DynamicStoreProvider::refresh` manages the whole roster uniformly.
    pub fn new(primary: (String, String), extras: Vec<String>) -> Self {
        let mut stores = vec![primary];
        for (i, url) in extras.into_iter().enumerate() {
            stores.push((format!("store-{i}"), url));
        }
        Self { stores }
    }
}

#[async_trait]
impl StoreDiscovery for StaticStoreDiscovery {
    async fn discover(&self) -> anyhow::Result<Vec<DiscoveredStoreConfig>> {
        Ok(self
            .stores
            .iter()
            .map(|(id, connection_string)| DiscoveredStoreConfig {
                id: id.clone(),
                connection_string: connection_string.clone(),
                is_control_plane: false,
            })
            .collect())
    }
}

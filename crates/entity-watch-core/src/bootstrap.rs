//! Builds a ready-to-poll registry from the application configuration.

use anyhow::{Context, Result};
use entity_watch_config::config::AppConfig;
use entity_watch_config::persistence::Persistence;
use entity_watch_engine::{KeyValueStateStore, TracingSink, WatchRegistry};
use std::sync::Arc;
use tracing::info;

use crate::remote::ServiceLayerClient;
use crate::sync::PersistenceBackend;

/// Cursor store backed by the DuckDB state file.
pub type DurableStateStore = KeyValueStateStore<PersistenceBackend>;

pub fn open_state_store(config: &AppConfig) -> Result<DurableStateStore> {
    let path = config.state_path()?;
    let persistence = Persistence::new(&path)
        .with_context(|| format!("Failed to open watcher state at {}", path.display()))?;
    info!("Using watcher state at {}", path.display());
    Ok(KeyValueStateStore::with_namespace(
        PersistenceBackend::new(persistence),
        config.state.namespace.clone(),
    ))
}

/// Remote client, durable state, a tracing sink and every configured entity.
pub fn build_registry(config: &AppConfig) -> Result<WatchRegistry> {
    let client = ServiceLayerClient::new(&config.remote)?;
    let store = open_state_store(config)?;

    let registry =
        WatchRegistry::new(Arc::new(client), Arc::new(store)).with_sink(Arc::new(TracingSink));
    for watcher in config.watcher_configs() {
        registry.register(watcher);
    }
    Ok(registry)
}

//! `KeyValueBackend` over the DuckDB `Persistence` handle.
//!
//! The engine cannot implement its own trait for a type from the config
//! crate, so the durable store goes through this thin adapter.

use anyhow::Result;
use entity_watch_config::persistence::{Persistence, StateEntry};
use entity_watch_engine::KeyValueBackend;
use serde_json::Value;

#[derive(Clone)]
pub struct PersistenceBackend {
    persistence: Persistence,
}

impl PersistenceBackend {
    /// Create a new backend over `persistence`.
    pub fn new(persistence: Persistence) -> Self {
        Self { persistence }
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    /// Raw rows under `prefix`, for inspection tooling.
    pub fn entries(&self, prefix: &str) -> Result<Vec<StateEntry>> {
        self.persistence.state_list(prefix)
    }
}

impl KeyValueBackend for PersistenceBackend {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.persistence.state_get(key)
    }

    fn put_forever(&self, key: &str, value: Value) -> Result<()> {
        self.persistence.state_put(key, &value)
    }

    fn forget(&self, key: &str) -> Result<()> {
        self.persistence.state_delete(key)
    }
}

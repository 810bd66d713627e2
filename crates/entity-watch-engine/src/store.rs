//! Durable per-entity cursor state.
//!
//! The tracker keeps three independent pieces of state per entity: the last
//! update check time, the highest primary key seen, and the key set from the
//! last deletion scan. [`StateStore`] is the contract; [`KeyValueStateStore`]
//! maps it onto any "store forever until deleted" key/value backing.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::key::PrimaryKey;

pub const DEFAULT_NAMESPACE: &str = "entity_watch.";

const LAST_CHECK_TIME_SUFFIX: &str = ".last_check_time";
const LAST_PRIMARY_KEY_SUFFIX: &str = ".last_primary_key";
const KNOWN_KEYS_SUFFIX: &str = ".known_keys";

/// Cursor storage used by the change tracker.
///
/// Every write must be durable before it returns. The three pieces are
/// written independently; no atomicity across them is required.
pub trait StateStore: Send + Sync {
    fn last_check_time(&self, entity: &str) -> Result<Option<String>>;

    fn set_last_check_time(&self, entity: &str, timestamp: &str) -> Result<()>;

    fn last_primary_key(&self, entity: &str) -> Result<Option<PrimaryKey>>;

    fn set_last_primary_key(&self, entity: &str, key: &PrimaryKey) -> Result<()>;

    /// Key set from the last deletion scan; empty when never stored.
    fn known_keys(&self, entity: &str) -> Result<HashSet<PrimaryKey>>;

    fn set_known_keys(&self, entity: &str, keys: &HashSet<PrimaryKey>) -> Result<()>;

    /// Remove all state for `entity`. Idempotent.
    fn clear(&self, entity: &str) -> Result<()>;
}

impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    fn last_check_time(&self, entity: &str) -> Result<Option<String>> {
        (**self).last_check_time(entity)
    }

    fn set_last_check_time(&self, entity: &str, timestamp: &str) -> Result<()> {
        (**self).set_last_check_time(entity, timestamp)
    }

    fn last_primary_key(&self, entity: &str) -> Result<Option<PrimaryKey>> {
        (**self).last_primary_key(entity)
    }

    fn set_last_primary_key(&self, entity: &str, key: &PrimaryKey) -> Result<()> {
        (**self).set_last_primary_key(entity, key)
    }

    fn known_keys(&self, entity: &str) -> Result<HashSet<PrimaryKey>> {
        (**self).known_keys(entity)
    }

    fn set_known_keys(&self, entity: &str, keys: &HashSet<PrimaryKey>) -> Result<()> {
        (**self).set_known_keys(entity, keys)
    }

    fn clear(&self, entity: &str) -> Result<()> {
        (**self).clear(entity)
    }
}

/// Snapshot of everything stored for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity: String,
    pub last_check_time: Option<String>,
    pub last_primary_key: Option<PrimaryKey>,
    pub known_keys: HashSet<PrimaryKey>,
}

impl EntityState {
    pub fn load(store: &dyn StateStore, entity: &str) -> Result<Self> {
        Ok(Self {
            entity: entity.to_string(),
            last_check_time: store.last_check_time(entity)?,
            last_primary_key: store.last_primary_key(entity)?,
            known_keys: store.known_keys(entity)?,
        })
    }
}

/// A key/value cache with unbounded retention.
pub trait KeyValueBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store without expiry, replacing any previous value.
    fn put_forever(&self, key: &str, value: Value) -> Result<()>;

    fn forget(&self, key: &str) -> Result<()>;
}

/// Process-local backing, mostly for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryBackend {
    /// Create a new empty backing.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow!("memory backend lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn put_forever(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow!("memory backend lock poisoned"))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn forget(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow!("memory backend lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}

/// [`StateStore`] on top of a [`KeyValueBackend`].
///
/// Keys are `{namespace}{entity}.last_check_time`, `.last_primary_key` and
/// `.known_keys`; values are stored as JSON.
pub struct KeyValueStateStore<B> {
    backend: B,
    namespace: String,
}

impl KeyValueStateStore<MemoryBackend> {
    /// Create a new store over a fresh [`MemoryBackend`].
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }
}

impl<B: KeyValueBackend> KeyValueStateStore<B> {
    /// Create a new store using [`DEFAULT_NAMESPACE`].
    pub fn new(backend: B) -> Self {
        Self::with_namespace(backend, DEFAULT_NAMESPACE)
    }

    /// Create a new store whose keys all start with `namespace`.
    pub fn with_namespace(backend: B, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    /// Get a reference to the underlying backing.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, entity: &str, suffix: &str) -> String {
        format!("{}{}{}", self.namespace, entity, suffix)
    }
}

impl<B: KeyValueBackend> StateStore for KeyValueStateStore<B> {
    fn last_check_time(&self, entity: &str) -> Result<Option<String>> {
        match self.backend.get(&self.key(entity, LAST_CHECK_TIME_SUFFIX))? {
            Some(Value::String(ts)) => Ok(Some(ts)),
            Some(Value::Null) | None => Ok(None),
            Some(other) => Err(anyhow!(
                "stored check time for {} is not a string: {}",
                entity,
                other
            )),
        }
    }

    fn set_last_check_time(&self, entity: &str, timestamp: &str) -> Result<()> {
        self.backend.put_forever(
            &self.key(entity, LAST_CHECK_TIME_SUFFIX),
            Value::String(timestamp.to_string()),
        )
    }

    fn last_primary_key(&self, entity: &str) -> Result<Option<PrimaryKey>> {
        match self.backend.get(&self.key(entity, LAST_PRIMARY_KEY_SUFFIX))? {
            Some(Value::Null) | None => Ok(None),
            Some(value) => PrimaryKey::from_value(&value)
                .map(Some)
                .ok_or_else(|| anyhow!("stored primary key for {} is invalid: {}", entity, value)),
        }
    }

    fn set_last_primary_key(&self, entity: &str, key: &PrimaryKey) -> Result<()> {
        self.backend
            .put_forever(&self.key(entity, LAST_PRIMARY_KEY_SUFFIX), key.to_value())
    }

    fn known_keys(&self, entity: &str) -> Result<HashSet<PrimaryKey>> {
        match self.backend.get(&self.key(entity, KNOWN_KEYS_SUFFIX))? {
            Some(Value::Null) | None => Ok(HashSet::new()),
            Some(value) => serde_json::from_value(value)
                .with_context(|| format!("Failed to decode known keys for {}", entity)),
        }
    }

    fn set_known_keys(&self, entity: &str, keys: &HashSet<PrimaryKey>) -> Result<()> {
        let value = serde_json::to_value(keys)
            .with_context(|| format!("Failed to encode known keys for {}", entity))?;
        self.backend
            .put_forever(&self.key(entity, KNOWN_KEYS_SUFFIX), value)
    }

    fn clear(&self, entity: &str) -> Result<()> {
        for suffix in [LAST_CHECK_TIME_SUFFIX, LAST_PRIMARY_KEY_SUFFIX, KNOWN_KEYS_SUFFIX] {
            self.backend.forget(&self.key(entity, suffix))?;
        }
        Ok(())
    }
}

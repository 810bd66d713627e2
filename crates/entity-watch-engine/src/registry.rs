//! Registry of watched entities and the poll fan-out across them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

use crate::change::Change;
use crate::config::WatcherConfig;
use crate::error::{Result, WatchError};
use crate::query::EntityCollection;
use crate::sink::ChangeSink;
use crate::store::{EntityState, StateStore};
use crate::tracker::ChangeTracker;

/// Changes per entity from one `poll_all`, in registration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollResults {
    entries: Vec<(String, Vec<Change>)>,
}

impl PollResults {
    pub fn get(&self, entity: &str) -> Option<&[Change]> {
        self.entries
            .iter()
            .find(|(name, _)| name == entity)
            .map(|(_, changes)| changes.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Change])> {
        self.entries
            .iter()
            .map(|(name, changes)| (name.as_str(), changes.as_slice()))
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Total number of changes across all entities.
    pub fn total(&self) -> usize {
        self.entries.iter().map(|(_, changes)| changes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Flatten into one list grouped by entity.
    pub fn into_changes(self) -> Vec<Change> {
        self.entries
            .into_iter()
            .flat_map(|(_, changes)| changes)
            .collect()
    }
}

/// Holds watcher configurations and runs their poll cycles.
///
/// Polls run sequentially. Each entity's detection holds an advisory lock
/// keyed by entity name, so overlapping callers in the same process cannot
/// race on the same cursors; different entities never contend. The lock is
/// released before callbacks and sinks run, so a callback may poll or reset
/// its own entity.
pub struct WatchRegistry {
    collection: Arc<dyn EntityCollection>,
    store: Arc<dyn StateStore>,
    sinks: Vec<Arc<dyn ChangeSink>>,
    watchers: RwLock<Vec<Arc<WatcherConfig>>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WatchRegistry {
    /// Create a new registry over `collection`, keeping cursors in `store`.
    pub fn new(collection: Arc<dyn EntityCollection>, store: Arc<dyn StateStore>) -> Self {
        Self {
            collection,
            store,
            sinks: Vec::new(),
            watchers: RwLock::new(Vec::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Add a notification sink for every watched entity.
    pub fn with_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Add a watcher, replacing one with the same entity name in place.
    pub fn register(&self, config: WatcherConfig) {
        let config = Arc::new(config);
        let mut watchers = self.watchers.write().unwrap_or_else(PoisonError::into_inner);
        match watchers.iter_mut().find(|w| w.entity == config.entity) {
            Some(existing) => {
                debug!(entity = %config.entity, "Replacing watcher");
                *existing = config;
            }
            None => {
                info!(entity = %config.entity, "Watching entity");
                watchers.push(config);
            }
        }
    }

    /// Register `entity` with default settings.
    pub fn watch(&self, entity: impl Into<String>) {
        self.register(WatcherConfig::new(entity));
    }

    /// Stop watching `entity`. Stored cursors are kept; use
    /// [`reset`](Self::reset) to drop them.
    pub fn unwatch(&self, entity: &str) -> bool {
        let mut watchers = self.watchers.write().unwrap_or_else(PoisonError::into_inner);
        let before = watchers.len();
        watchers.retain(|w| w.entity != entity);
        let removed = watchers.len() != before;
        drop(watchers);
        if removed {
            self.release_lock(entity);
            info!(entity, "Stopped watching entity");
        }
        removed
    }

    pub fn is_watching(&self, entity: &str) -> bool {
        self.config(entity).is_some()
    }

    /// Registered entity names in registration order.
    pub fn entities(&self) -> Vec<String> {
        self.snapshot().iter().map(|w| w.entity.clone()).collect()
    }

    pub fn config(&self, entity: &str) -> Option<Arc<WatcherConfig>> {
        self.snapshot().into_iter().find(|w| w.entity == entity)
    }

    /// Run one detection cycle for `entity`. Unregistered entities yield no
    /// changes.
    pub fn poll_entity(&self, entity: &str) -> Result<Vec<Change>> {
        let Some(config) = self.config(entity) else {
            debug!(entity, "Poll requested for unregistered entity");
            return Ok(Vec::new());
        };
        self.run(&config)
    }

    /// Poll every registered entity in turn. The first failure aborts the
    /// cycle; entities polled before it keep their advanced cursors.
    pub fn poll_all(&self) -> Result<PollResults> {
        let mut results = PollResults::default();
        for config in self.snapshot() {
            let changes = self.run(&config)?;
            results.entries.push((config.entity.clone(), changes));
        }
        debug!(
            entities = results.entries.len(),
            changes = results.total(),
            "Poll cycle finished"
        );
        Ok(results)
    }

    /// [`poll_all`](Self::poll_all) flattened into one list.
    pub fn poll(&self) -> Result<Vec<Change>> {
        Ok(self.poll_all()?.into_changes())
    }

    /// Clear stored state for `entity`, registered or not.
    pub fn reset(&self, entity: &str) -> Result<()> {
        let cleared = {
            let lock = self.lock_for(entity);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            info!(entity, "Resetting watcher state");
            self.store
                .clear(entity)
                .map_err(|e| WatchError::store(entity, e))
        };
        if !self.is_watching(entity) {
            self.release_lock(entity);
        }
        cleared
    }

    /// Clear stored state for every currently registered entity.
    pub fn reset_all(&self) -> Result<()> {
        for entity in self.entities() {
            self.reset(&entity)?;
        }
        Ok(())
    }

    /// Stored cursors for `entity`.
    pub fn state(&self, entity: &str) -> Result<EntityState> {
        EntityState::load(self.store.as_ref(), entity).map_err(|e| WatchError::store(entity, e))
    }

    fn snapshot(&self) -> Vec<Arc<WatcherConfig>> {
        self.watchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_for(&self, entity: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(entity.to_string()).or_default().clone()
    }

    /// Drop the lock entry for `entity` unless a poll or reset holds it.
    fn release_lock(&self, entity: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(entity).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(entity);
        }
    }

    fn run(&self, config: &WatcherConfig) -> Result<Vec<Change>> {
        let tracker = ChangeTracker::new(config, self.collection.as_ref(), self.store.as_ref())
            .with_sinks(&self.sinks);

        let changes = {
            let lock = self.lock_for(&config.entity);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            tracker.detect()?
        };

        tracker.dispatch(&changes);
        Ok(changes)
    }
}

//! Change detection for a single entity.
//!
//! A poll runs up to three independent passes, each gated by its
//! configuration flag:
//!
//! - **created**: newest `batch_size` records by primary key descending; every
//!   key strictly after the stored highest key is a creation. The first poll
//!   only records the baseline. More than `batch_size` creations between two
//!   polls means the older ones are never reported.
//! - **updated**: records whose update field is at or after the stored check
//!   time. The bound is inclusive, so a record can be reported again while its
//!   timestamp stays put; consumers must treat updates idempotently.
//! - **deleted**: full paginated key scan diffed against the previous scan.
//!   Cost is linear in the collection size on every poll.
//!
//! Each pass writes its cursor only after its own query succeeded, so a
//! failure leaves earlier passes committed and the failing one untouched.

use chrono::Utc;
use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;
use tracing::{debug, info};

use crate::change::{Change, Record};
use crate::config::WatcherConfig;
use crate::error::{Result, WatchError};
use crate::key::PrimaryKey;
use crate::query::{EntityCollection, Filter, Query, SortDirection};
use crate::sink::ChangeSink;
use crate::store::StateStore;

/// Detection logic bound to one watcher configuration.
///
/// Assumes at most one poll per entity runs at a time; the registry enforces
/// this within a process.
pub struct ChangeTracker<'a> {
    config: &'a WatcherConfig,
    collection: &'a dyn EntityCollection,
    store: &'a dyn StateStore,
    sinks: &'a [Arc<dyn ChangeSink>],
}

impl<'a> ChangeTracker<'a> {
    /// Create a new tracker with no notification sinks.
    pub fn new(
        config: &'a WatcherConfig,
        collection: &'a dyn EntityCollection,
        store: &'a dyn StateStore,
    ) -> Self {
        Self {
            config,
            collection,
            store,
            sinks: &[],
        }
    }

    /// Notify `sinks` in addition to the watcher's own callbacks.
    pub fn with_sinks(mut self, sinks: &'a [Arc<dyn ChangeSink>]) -> Self {
        self.sinks = sinks;
        self
    }

    /// Name of the watched entity.
    pub fn entity(&self) -> &str {
        &self.config.entity
    }

    /// Run every enabled pass and dispatch the combined result.
    ///
    /// Changes are ordered created, then updated, then deleted.
    pub fn poll(&self) -> Result<Vec<Change>> {
        let changes = self.detect()?;
        self.dispatch(&changes);
        Ok(changes)
    }

    /// Run every enabled pass and advance the cursors without notifying
    /// callbacks or sinks.
    pub fn detect(&self) -> Result<Vec<Change>> {
        let mut changes = Vec::new();

        if self.config.detect_created {
            changes.extend(self.detect_created()?);
        }
        if self.config.detect_updated {
            changes.extend(self.detect_updated()?);
        }
        if self.config.detect_deleted {
            changes.extend(self.detect_deleted()?);
        }
        Ok(changes)
    }

    /// Forget every cursor stored for this entity.
    pub fn reset(&self) -> Result<()> {
        info!(entity = %self.entity(), "Resetting watcher state");
        self.store
            .clear(self.entity())
            .map_err(|e| WatchError::store(self.entity(), e))
    }

    fn detect_created(&self) -> Result<Vec<Change>> {
        let entity = self.entity();
        let query = Query::new(self.config.batch_size)
            .with_filter(self.config.filter.clone().map(Filter::Expression))
            .with_select(self.projection())
            .order_by(&self.config.primary_key, SortDirection::Desc);

        let records = self.fetch(&query)?;
        let Some(first) = records.first() else {
            debug!(entity, "No records for creation check");
            return Ok(Vec::new());
        };
        let newest = self.key_of(first)?;

        let last = self
            .store
            .last_primary_key(entity)
            .map_err(|e| WatchError::store(entity, e))?;

        let changes = match last {
            None => {
                info!(entity, newest = %newest, "Recorded creation baseline");
                Vec::new()
            }
            Some(last) => {
                let mut changes = Vec::new();
                for record in &records {
                    let key = self.key_of(record)?;
                    if key.is_after(&last) {
                        changes.push(Change::created(entity, key, record.clone()));
                    }
                }
                changes
            }
        };

        self.store
            .set_last_primary_key(entity, &newest)
            .map_err(|e| WatchError::store(entity, e))?;

        debug!(entity, created = changes.len(), "Creation check finished");
        Ok(changes)
    }

    fn detect_updated(&self) -> Result<Vec<Change>> {
        let entity = self.entity();
        let started = self.now()?;

        let since = self
            .store
            .last_check_time(entity)
            .map_err(|e| WatchError::store(entity, e))?;

        let bound = since.map(|ts| Filter::at_least(&self.config.update_field, ts));
        let filter = match (self.config.filter.clone().map(Filter::Expression), bound) {
            (Some(filter), Some(bound)) => Some(filter.and(bound)),
            (filter, bound) => filter.or(bound),
        };

        let query = Query::new(self.config.batch_size)
            .with_filter(filter)
            .with_select(self.projection());

        let records = self.fetch(&query)?;
        let mut changes = Vec::with_capacity(records.len());
        for record in records {
            let key = self.key_of(&record)?;
            changes.push(Change::updated(entity, key, record, None));
        }

        self.store
            .set_last_check_time(entity, &started)
            .map_err(|e| WatchError::store(entity, e))?;

        debug!(entity, updated = changes.len(), "Update check finished");
        Ok(changes)
    }

    fn detect_deleted(&self) -> Result<Vec<Change>> {
        let entity = self.entity();
        let known = self
            .store
            .known_keys(entity)
            .map_err(|e| WatchError::store(entity, e))?;

        let current = self.fetch_all_keys()?;

        let changes: Vec<Change> = if known.is_empty() {
            info!(entity, keys = current.len(), "Recorded deletion baseline");
            Vec::new()
        } else {
            known
                .difference(&current)
                .cloned()
                .map(|key| Change::deleted(entity, key, None))
                .collect()
        };

        self.store
            .set_known_keys(entity, &current)
            .map_err(|e| WatchError::store(entity, e))?;

        debug!(entity, deleted = changes.len(), "Deletion check finished");
        Ok(changes)
    }

    /// Configured projection, widened with the primary key when it is missing.
    fn projection(&self) -> Vec<String> {
        let mut select = self.config.select.clone();
        if !select.is_empty() && !select.contains(&self.config.primary_key) {
            select.push(self.config.primary_key.clone());
        }
        select
    }

    /// Page through the whole collection projecting only the primary key.
    fn fetch_all_keys(&self) -> Result<HashSet<PrimaryKey>> {
        let page_size = self.config.batch_size.max(1);
        let mut keys = HashSet::new();
        let mut skip = 0;

        loop {
            let query = Query::new(page_size)
                .with_filter(self.config.filter.clone().map(Filter::Expression))
                .with_select(vec![self.config.primary_key.clone()])
                .order_by(&self.config.primary_key, SortDirection::Asc)
                .with_skip(skip);

            let page = self.fetch(&query)?;
            for record in &page {
                keys.insert(self.key_of(record)?);
            }

            if page.len() < page_size {
                break;
            }
            skip += page_size;
        }

        debug!(entity = %self.entity(), keys = keys.len(), "Scanned key space");
        Ok(keys)
    }

    /// Current wall-clock time in the configured cursor format.
    fn now(&self) -> Result<String> {
        let mut rendered = String::new();
        write!(rendered, "{}", Utc::now().format(&self.config.timestamp_format)).map_err(|_| {
            WatchError::InvalidTimestampFormat {
                entity: self.entity().to_string(),
                format: self.config.timestamp_format.clone(),
            }
        })?;
        Ok(rendered)
    }

    fn fetch(&self, query: &Query) -> Result<Vec<Record>> {
        debug!(entity = %self.entity(), ?query, "Querying remote collection");
        self.collection
            .query(self.entity(), query)
            .map_err(|e| WatchError::remote(self.entity(), e))
    }

    fn key_of(&self, record: &Record) -> Result<PrimaryKey> {
        record
            .get(&self.config.primary_key)
            .and_then(PrimaryKey::from_value)
            .ok_or_else(|| WatchError::MissingPrimaryKey {
                entity: self.entity().to_string(),
                field: self.config.primary_key.clone(),
            })
    }

    /// Batch notification first, then per change: type callback, any
    /// callback, single notification.
    pub(crate) fn dispatch(&self, changes: &[Change]) {
        if changes.is_empty() {
            return;
        }

        for sink in self.sinks {
            sink.changes_detected(self.entity(), changes);
        }

        for change in changes {
            if let Some(callback) = self.config.callback(change.change_type) {
                callback(change);
            }
            if let Some(callback) = self.config.any_callback() {
                callback(change);
            }
            for sink in self.sinks {
                sink.change_detected(change);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeType;
    use crate::sink::{ChangeEvent, ChannelSink};
    use crate::store::{KeyValueBackend, KeyValueStateStore, MemoryBackend};
    use crate::test_utils::MemoryCollection;
    use serde_json::json;
    use std::sync::Mutex;

    fn orders(keys: &[i64]) -> MemoryCollection {
        let collection = MemoryCollection::new();
        for key in keys {
            collection.insert(
                "Orders",
                json!({"DocEntry": key, "UpdateDate": "2024-06-01T00:00:00Z"}),
            );
        }
        collection
    }

    #[test]
    fn disabled_passes_issue_no_queries() {
        let collection = orders(&[1, 2]);
        let store = KeyValueStateStore::in_memory();
        let config = WatcherConfig::new("Orders").detect_created(false).detect_updated(false);

        let changes = ChangeTracker::new(&config, &collection, &store).poll().unwrap();

        assert!(changes.is_empty());
        assert!(collection.queries().is_empty());
    }

    #[test]
    fn creation_query_orders_by_key_descending_with_filter_and_projection() {
        let collection = orders(&[1]);
        let store = KeyValueStateStore::in_memory();
        let config = WatcherConfig::new("Orders")
            .only_created()
            .with_filter("DocEntry ge 0")
            .with_select(["DocEntry"])
            .with_batch_size(25);

        ChangeTracker::new(&config, &collection, &store).poll().unwrap();

        let queries = collection.queries();
        assert_eq!(queries.len(), 1);
        let (entity, query) = &queries[0];
        assert_eq!(entity, "Orders");
        assert_eq!(query.top, 25);
        assert_eq!(query.order_by.as_ref().unwrap().to_string(), "DocEntry desc");
        assert_eq!(query.filter, Some(Filter::expression("DocEntry ge 0")));
        assert_eq!(query.select, vec!["DocEntry"]);
    }

    #[test]
    fn empty_collection_leaves_creation_cursor_absent() {
        let collection = MemoryCollection::new();
        let store = KeyValueStateStore::in_memory();
        let config = WatcherConfig::new("Orders").only_created();

        ChangeTracker::new(&config, &collection, &store).poll().unwrap();

        assert_eq!(store.last_primary_key("Orders").unwrap(), None);
    }

    #[test]
    fn creation_cursor_follows_newest_key_even_without_new_records() {
        let collection = orders(&[10, 11]);
        let store = KeyValueStateStore::in_memory();
        store.set_last_primary_key("Orders", &PrimaryKey::Int(20)).unwrap();
        let config = WatcherConfig::new("Orders").only_created();

        let changes = ChangeTracker::new(&config, &collection, &store).poll().unwrap();

        assert!(changes.is_empty());
        assert_eq!(store.last_primary_key("Orders").unwrap(), Some(PrimaryKey::Int(11)));
    }

    #[test]
    fn creations_beyond_batch_size_are_skipped() {
        let collection = orders(&[1, 2, 3, 4, 5, 6]);
        let store = KeyValueStateStore::in_memory();
        store.set_last_primary_key("Orders", &PrimaryKey::Int(1)).unwrap();
        let config = WatcherConfig::new("Orders").only_created().with_batch_size(2);

        let changes = ChangeTracker::new(&config, &collection, &store).poll().unwrap();

        let keys: Vec<PrimaryKey> = changes.iter().map(|c| c.key.clone()).collect();
        assert_eq!(keys, vec![PrimaryKey::Int(6), PrimaryKey::Int(5)]);
        assert_eq!(store.last_primary_key("Orders").unwrap(), Some(PrimaryKey::Int(6)));
    }

    #[test]
    fn first_update_check_has_no_timestamp_bound() {
        let collection = orders(&[1, 2]);
        let store = KeyValueStateStore::in_memory();
        let config = WatcherConfig::new("Orders").only_updated();

        let changes = ChangeTracker::new(&config, &collection, &store).poll().unwrap();

        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.change_type == ChangeType::Updated && c.previous.is_none()));
        assert_eq!(collection.queries()[0].1.filter, None);
        assert!(store.last_check_time("Orders").unwrap().is_some());
    }

    #[test]
    fn update_bound_is_anded_with_configured_filter() {
        let collection = orders(&[1]);
        let store = KeyValueStateStore::in_memory();
        store.set_last_check_time("Orders", "2024-01-01T00:00:00Z").unwrap();
        let config = WatcherConfig::new("Orders")
            .only_updated()
            .with_filter("DocEntry eq 1");

        let changes = ChangeTracker::new(&config, &collection, &store).poll().unwrap();

        assert_eq!(changes.len(), 1);
        let filter = collection.queries()[0].1.filter.clone().unwrap();
        assert_eq!(
            filter.to_string(),
            "(DocEntry eq 1) and (UpdateDate ge '2024-01-01T00:00:00Z')"
        );
    }

    #[test]
    fn check_time_advances_even_when_nothing_changed() {
        let collection = MemoryCollection::new();
        let store = KeyValueStateStore::in_memory();
        store.set_last_check_time("Orders", "2000-01-01T00:00:00Z").unwrap();
        let config = WatcherConfig::new("Orders").only_updated();

        ChangeTracker::new(&config, &collection, &store).poll().unwrap();

        let stored = store.last_check_time("Orders").unwrap().unwrap();
        assert!(stored.as_str() > "2000-01-01T00:00:00Z");
    }

    #[test]
    fn deletion_scan_pages_until_short_page() {
        let collection = orders(&[1, 2, 3, 4, 5]);
        let store = KeyValueStateStore::in_memory();
        let config = WatcherConfig::new("Orders")
            .detect_created(false)
            .detect_updated(false)
            .detect_deleted(true)
            .with_batch_size(2);

        ChangeTracker::new(&config, &collection, &store).poll().unwrap();

        let skips: Vec<usize> = collection.queries().iter().map(|(_, q)| q.skip).collect();
        assert_eq!(skips, vec![0, 2, 4]);
        assert!(collection
            .queries()
            .iter()
            .all(|(_, q)| q.select == vec!["DocEntry".to_string()]));
        assert_eq!(store.known_keys("Orders").unwrap().len(), 5);
    }

    #[test]
    fn exact_multiple_of_page_size_ends_on_empty_page() {
        let collection = orders(&[1, 2, 3, 4]);
        let store = KeyValueStateStore::in_memory();
        let config = WatcherConfig::new("Orders")
            .only_updated()
            .detect_updated(false)
            .detect_deleted(true)
            .with_batch_size(2);

        ChangeTracker::new(&config, &collection, &store).poll().unwrap();

        assert_eq!(collection.queries().len(), 3);
    }

    #[test]
    fn failed_pass_keeps_earlier_cursors_and_its_own() {
        let collection = orders(&[1, 2, 3]);
        let store = KeyValueStateStore::in_memory();
        store.set_last_primary_key("Orders", &PrimaryKey::Int(1)).unwrap();
        store.set_last_check_time("Orders", "2024-01-01T00:00:00Z").unwrap();
        // second query of the poll is the update check
        collection.fail_query(1, "service unavailable");
        let config = WatcherConfig::new("Orders");

        let err = ChangeTracker::new(&config, &collection, &store).poll().unwrap_err();

        assert!(matches!(err, WatchError::Remote { .. }));
        assert_eq!(err.entity(), "Orders");
        assert_eq!(store.last_primary_key("Orders").unwrap(), Some(PrimaryKey::Int(3)));
        assert_eq!(
            store.last_check_time("Orders").unwrap().as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    /// Memory backing that rejects writes to one key.
    struct RejectingBackend {
        inner: MemoryBackend,
        rejected: String,
    }

    impl KeyValueBackend for RejectingBackend {
        fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
            self.inner.get(key)
        }

        fn put_forever(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()> {
            if key == self.rejected {
                anyhow::bail!("disk full");
            }
            self.inner.put_forever(key, value)
        }

        fn forget(&self, key: &str) -> anyhow::Result<()> {
            self.inner.forget(key)
        }
    }

    #[test]
    fn failed_state_write_keeps_earlier_cursors() {
        let collection = orders(&[1, 2, 3]);
        let store = KeyValueStateStore::new(RejectingBackend {
            inner: MemoryBackend::new(),
            rejected: "entity_watch.Orders.last_check_time".to_string(),
        });
        store.set_last_primary_key("Orders", &PrimaryKey::Int(1)).unwrap();
        let config = WatcherConfig::new("Orders");

        let err = ChangeTracker::new(&config, &collection, &store).poll().unwrap_err();

        match &err {
            WatchError::Store { entity, source } => {
                assert_eq!(entity, "Orders");
                assert!(source.to_string().contains("disk full"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.last_primary_key("Orders").unwrap(), Some(PrimaryKey::Int(3)));
        assert_eq!(store.last_check_time("Orders").unwrap(), None);
    }

    #[test]
    fn projection_always_carries_the_primary_key() {
        let collection = MemoryCollection::new();
        collection.insert("Orders", json!({"DocEntry": 1, "DocTotal": 10}));
        let store = KeyValueStateStore::in_memory();
        let config = WatcherConfig::new("Orders")
            .only_updated()
            .with_select(["DocTotal"]);

        let changes = ChangeTracker::new(&config, &collection, &store).poll().unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, PrimaryKey::Int(1));
        assert_eq!(collection.queries()[0].1.select, vec!["DocTotal", "DocEntry"]);
    }

    #[test]
    fn record_without_key_is_a_configuration_error() {
        let collection = orders(&[1]);
        let store = KeyValueStateStore::in_memory();
        let config = WatcherConfig::new("Orders").only_created().with_primary_key("Code");

        let err = ChangeTracker::new(&config, &collection, &store).poll().unwrap_err();

        match err {
            WatchError::MissingPrimaryKey { entity, field } => {
                assert_eq!(entity, "Orders");
                assert_eq!(field, "Code");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn dispatch_order_is_batch_then_callbacks_then_single() {
        let collection = orders(&[1, 2]);
        let store = KeyValueStateStore::in_memory();
        store.set_last_primary_key("Orders", &PrimaryKey::Int(1)).unwrap();

        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let (typed, any) = (log.clone(), log.clone());
        let config = WatcherConfig::new("Orders")
            .only_created()
            .on_created(move |c| typed.lock().unwrap().push(format!("created:{}", c.key)))
            .on_updated(|_| panic!("no updates expected"))
            .on_any(move |c| any.lock().unwrap().push(format!("any:{}", c.key)));

        let (sink, events) = ChannelSink::new();
        let sinks: Vec<Arc<dyn ChangeSink>> = vec![Arc::new(sink)];

        let changes = ChangeTracker::new(&config, &collection, &store)
            .with_sinks(&sinks)
            .poll()
            .unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["created:2", "any:2"]);

        let events: Vec<ChangeEvent> = events.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ChangeEvent::Batch { entity, changes } if entity == "Orders" && changes.len() == 1));
        assert!(matches!(&events[1], ChangeEvent::Single(c) if c.key == PrimaryKey::Int(2)));
    }

    #[test]
    fn empty_poll_sends_no_notifications() {
        let collection = MemoryCollection::new();
        let store = KeyValueStateStore::in_memory();
        let config = WatcherConfig::new("Orders");
        let (sink, events) = ChannelSink::new();
        let sinks: Vec<Arc<dyn ChangeSink>> = vec![Arc::new(sink)];

        ChangeTracker::new(&config, &collection, &store)
            .with_sinks(&sinks)
            .poll()
            .unwrap();

        assert_eq!(events.try_iter().count(), 0);
    }

    #[test]
    fn invalid_timestamp_format_fails_before_querying() {
        let collection = orders(&[1]);
        let store = KeyValueStateStore::in_memory();
        let config = WatcherConfig::new("Orders")
            .only_updated()
            .with_timestamp_format("%Y-%Q");

        let err = ChangeTracker::new(&config, &collection, &store).poll().unwrap_err();

        assert!(matches!(err, WatchError::InvalidTimestampFormat { .. }));
        assert!(collection.queries().is_empty());
        assert_eq!(store.last_check_time("Orders").unwrap(), None);
    }

    #[test]
    fn reset_clears_all_cursors() {
        let collection = orders(&[1, 2]);
        let store = KeyValueStateStore::in_memory();
        let config = WatcherConfig::new("Orders").detect_deleted(true);
        let tracker = ChangeTracker::new(&config, &collection, &store);

        tracker.poll().unwrap();
        tracker.reset().unwrap();

        assert_eq!(store.last_primary_key("Orders").unwrap(), None);
        assert_eq!(store.last_check_time("Orders").unwrap(), None);
        assert!(store.known_keys("Orders").unwrap().is_empty());
    }
}

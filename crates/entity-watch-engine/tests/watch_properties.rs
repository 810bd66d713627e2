use entity_watch_engine::test_utils::MemoryCollection;
use entity_watch_engine::{
    ChangeTracker, ChangeType, KeyValueStateStore, PrimaryKey, StateStore, WatchRegistry,
    WatcherConfig,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

fn int_keys(keys: &[i64]) -> HashSet<PrimaryKey> {
    keys.iter().copied().map(PrimaryKey::Int).collect()
}

fn seed(collection: &MemoryCollection, entity: &str, keys: &[i64]) {
    for key in keys {
        collection.insert(
            entity,
            json!({"DocEntry": key, "UpdateDate": "2024-12-31T00:00:00Z"}),
        );
    }
}

#[test]
fn baseline_poll_emits_no_creations_and_stores_newest_key() {
    let collection = MemoryCollection::new();
    seed(&collection, "Orders", &[4, 9, 2, 7]);
    let store = KeyValueStateStore::in_memory();
    let config = WatcherConfig::new("Orders").only_created().with_batch_size(3);

    let changes = ChangeTracker::new(&config, &collection, &store).poll().unwrap();

    assert!(changes.is_empty());
    assert_eq!(store.last_primary_key("Orders").unwrap(), Some(PrimaryKey::Int(9)));
}

#[test]
fn detects_records_above_the_stored_key() {
    let collection = MemoryCollection::new();
    seed(&collection, "Orders", &[498, 499, 500, 501, 502]);
    let store = KeyValueStateStore::in_memory();
    store.set_last_primary_key("Orders", &PrimaryKey::Int(500)).unwrap();
    let config = WatcherConfig::new("Orders").only_created().with_batch_size(5);

    let changes = ChangeTracker::new(&config, &collection, &store).poll().unwrap();

    let mut keys: Vec<PrimaryKey> = changes.iter().map(|c| c.key.clone()).collect();
    keys.sort_by(|a, b| a.compare(b));
    assert_eq!(keys, vec![PrimaryKey::Int(501), PrimaryKey::Int(502)]);
    assert!(changes.iter().all(|c| c.change_type == ChangeType::Created));
    assert_eq!(store.last_primary_key("Orders").unwrap(), Some(PrimaryKey::Int(502)));
}

#[test]
fn string_keys_follow_lexicographic_order() {
    let collection = MemoryCollection::new();
    for code in ["A10", "A9", "B1"] {
        collection.insert("Items", json!({"ItemCode": code}));
    }
    let store = KeyValueStateStore::in_memory();
    store.set_last_primary_key("Items", &PrimaryKey::from("A2")).unwrap();
    let config = WatcherConfig::new("Items")
        .only_created()
        .with_primary_key("ItemCode");

    let changes = ChangeTracker::new(&config, &collection, &store).poll().unwrap();

    // "A10" sorts before "A2", so it is never reported as created
    let keys: Vec<String> = changes.iter().map(|c| c.key.to_string()).collect();
    assert_eq!(keys, vec!["B1", "A9"]);
    assert_eq!(store.last_primary_key("Items").unwrap(), Some(PrimaryKey::from("B1")));
}

#[test]
fn update_bound_includes_the_exact_cursor_value() {
    let collection = MemoryCollection::new();
    collection.insert("Orders", json!({"DocEntry": 1, "UpdateDate": "2025-01-01T00:00:00Z"}));
    collection.insert("Orders", json!({"DocEntry": 2, "UpdateDate": "2024-12-31T23:59:59Z"}));
    let store = KeyValueStateStore::in_memory();
    store.set_last_check_time("Orders", "2025-01-01T00:00:00Z").unwrap();
    let config = WatcherConfig::new("Orders").only_updated();

    let changes = ChangeTracker::new(&config, &collection, &store).poll().unwrap();

    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].key, PrimaryKey::Int(1));
    assert_eq!(changes[0].change_type, ChangeType::Updated);
    assert_eq!(changes[0].current["UpdateDate"], "2025-01-01T00:00:00Z");
    assert!(changes[0].previous.is_none());
}

#[test]
fn deletion_baseline_then_diff() {
    let collection = MemoryCollection::new();
    seed(&collection, "Orders", &[1, 2, 3, 4, 5]);
    let store = KeyValueStateStore::in_memory();
    let config = WatcherConfig::new("Orders")
        .detect_created(false)
        .detect_updated(false)
        .detect_deleted(true)
        .with_batch_size(2);
    let tracker = ChangeTracker::new(&config, &collection, &store);

    assert!(tracker.poll().unwrap().is_empty());
    assert_eq!(store.known_keys("Orders").unwrap(), int_keys(&[1, 2, 3, 4, 5]));

    collection.remove("Orders", "DocEntry", &PrimaryKey::Int(3));
    let changes = tracker.poll().unwrap();

    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].change_type, ChangeType::Deleted);
    assert_eq!(changes[0].key, PrimaryKey::Int(3));
    assert!(changes[0].current.is_empty());
    assert_eq!(store.known_keys("Orders").unwrap(), int_keys(&[1, 2, 4, 5]));
}

#[test]
fn deletion_scan_respects_configured_filter() {
    let collection = MemoryCollection::new();
    collection.insert("Orders", json!({"DocEntry": 1, "Status": "open"}));
    collection.insert("Orders", json!({"DocEntry": 2, "Status": "closed"}));
    let store = KeyValueStateStore::in_memory();
    let config = WatcherConfig::new("Orders")
        .detect_created(false)
        .detect_updated(false)
        .detect_deleted(true)
        .with_filter("Status eq 'open'");

    ChangeTracker::new(&config, &collection, &store).poll().unwrap();

    assert_eq!(store.known_keys("Orders").unwrap(), int_keys(&[1]));
}

#[test]
fn poll_orders_created_then_updated_then_deleted() {
    let collection = MemoryCollection::new();
    seed(&collection, "Orders", &[1, 2, 3]);
    let store = KeyValueStateStore::in_memory();
    let config = WatcherConfig::new("Orders").detect_deleted(true);
    let tracker = ChangeTracker::new(&config, &collection, &store);
    tracker.poll().unwrap();

    collection.remove("Orders", "DocEntry", &PrimaryKey::Int(1));
    collection.insert("Orders", json!({"DocEntry": 4, "UpdateDate": "2999-01-01T00:00:00Z"}));
    let changes = tracker.poll().unwrap();

    let types: Vec<ChangeType> = changes.iter().map(|c| c.change_type).collect();
    assert_eq!(
        types,
        vec![ChangeType::Created, ChangeType::Updated, ChangeType::Deleted]
    );
}

#[test]
fn reset_isolates_entities() {
    let collection = Arc::new(MemoryCollection::new());
    seed(&collection, "Items", &[1, 2]);
    seed(&collection, "Orders", &[10, 11]);
    let store = Arc::new(KeyValueStateStore::in_memory());
    let registry = WatchRegistry::new(collection.clone(), store.clone());
    for entity in ["Items", "Orders"] {
        registry.register(WatcherConfig::new(entity).detect_deleted(true));
    }
    registry.poll().unwrap();
    let orders_before = registry.state("Orders").unwrap();

    registry.reset("Items").unwrap();

    let items = registry.state("Items").unwrap();
    assert!(items.last_primary_key.is_none());
    assert!(items.last_check_time.is_none());
    assert!(items.known_keys.is_empty());
    assert_eq!(registry.state("Orders").unwrap(), orders_before);

    // Orders is past its baseline, so a new record is reported
    seed(&collection, "Orders", &[12]);
    let changes = registry.poll_entity("Orders").unwrap();
    assert!(changes
        .iter()
        .any(|c| c.change_type == ChangeType::Created && c.key == PrimaryKey::Int(12)));
}

#[test]
fn unwatch_keeps_cursors_until_reset() {
    let collection = Arc::new(MemoryCollection::new());
    seed(&collection, "Items", &[1, 2]);
    let registry = WatchRegistry::new(
        collection.clone(),
        Arc::new(KeyValueStateStore::in_memory()),
    );
    registry.register(WatcherConfig::new("Items").only_created());
    registry.poll_entity("Items").unwrap();

    assert!(registry.unwatch("Items"));
    assert!(registry.entities().is_empty());
    assert!(registry.poll_all().unwrap().get("Items").is_none());

    seed(&collection, "Items", &[3]);
    registry.register(WatcherConfig::new("Items").only_created());
    let changes = registry.poll_entity("Items").unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].key, PrimaryKey::Int(3));

    registry.unwatch("Items");
    registry.reset("Items").unwrap();
    seed(&collection, "Items", &[4]);
    registry.register(WatcherConfig::new("Items").only_created());
    assert!(registry.poll_entity("Items").unwrap().is_empty());
}

pub use entity_watch_config::{config, persistence};
pub use entity_watch_core::{bootstrap, remote, scheduler, sync};
pub use entity_watch_engine::{
    change, error, key, query, registry, sink, store, test_utils, tracker,
};

pub use entity_watch_config::AppConfig;
pub use entity_watch_core::{build_registry, PollScheduler, SchedulerConfig, ServiceLayerClient};
pub use entity_watch_engine::{
    Change, ChangeSink, ChangeTracker, ChangeType, EntityCollection, PrimaryKey, StateStore,
    WatchError, WatchRegistry, WatcherConfig,
};

//! Change detection engine for remote entity collections.
//!
//! The remote backend exposes its entities only through paginated, filterable
//! point-in-time queries. This crate infers created, updated and deleted
//! records by polling those queries and remembering a few cursors per entity.
//!
//! # Features
//!
//! - **Creation detection**: newest records by primary key, compared against the
//!   highest key seen so far.
//! - **Update detection**: records whose update timestamp is at or after the
//!   last check time.
//! - **Deletion detection**: full key-space scan diffed against the previous
//!   scan. Linear in collection size on every poll, so it is off by default.
//! - **Durable cursors**: all progress lives behind the [`StateStore`] trait.
//!
//! # Preconditions
//!
//! Creation detection assumes primary keys are assigned in increasing order
//! under [`PrimaryKey::compare`]. Free-form string codes that do not sort with
//! creation order are not detected as created.
//!
//! # Usage
//!
//! ```ignore
//! use entity_watch_engine::{KeyValueStateStore, WatchRegistry, WatcherConfig};
//!
//! let registry = WatchRegistry::new(collection, Arc::new(KeyValueStateStore::in_memory()));
//! registry.register(
//!     WatcherConfig::new("Orders")
//!         .with_filter("DocumentStatus eq 'bost_Open'")
//!         .on_created(|change| println!("new order {}", change.key)),
//! );
//!
//! // Called by whatever scheduler decides when to poll
//! let changes = registry.poll()?;
//! ```

pub mod change;
pub mod config;
pub mod error;
pub mod key;
pub mod query;
pub mod registry;
pub mod sink;
pub mod store;
pub mod test_utils;
pub mod tracker;

// Re-export main types for convenience
pub use change::{Change, ChangeType, FieldDiff, Record};
pub use config::{ChangeCallback, WatcherConfig, DEFAULT_BATCH_SIZE, DEFAULT_TIMESTAMP_FORMAT};
pub use error::{Result, WatchError};
pub use key::PrimaryKey;
pub use query::{EntityCollection, Filter, OrderBy, Query, SortDirection};
pub use registry::{PollResults, WatchRegistry};
pub use sink::{ChangeEvent, ChangeSink, ChannelSink, TracingSink};
pub use store::{EntityState, KeyValueBackend, KeyValueStateStore, MemoryBackend, StateStore};
pub use tracker::ChangeTracker;

//! Per-entity watcher settings.

use std::fmt;
use std::sync::Arc;

use crate::change::{Change, ChangeType};

pub const DEFAULT_PRIMARY_KEY: &str = "DocEntry";
pub const DEFAULT_UPDATE_FIELD: &str = "UpdateDate";
pub const DEFAULT_CREATE_FIELD: &str = "CreateDate";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Synchronous in-process callback for detected changes.
pub type ChangeCallback = Arc<dyn Fn(&Change) + Send + Sync>;

/// One callback slot per change type plus the "any change" slot.
#[derive(Clone, Default)]
struct Callbacks {
    created: Option<ChangeCallback>,
    updated: Option<ChangeCallback>,
    deleted: Option<ChangeCallback>,
    any: Option<ChangeCallback>,
}

impl Callbacks {
    fn slot_mut(&mut self, change_type: ChangeType) -> &mut Option<ChangeCallback> {
        match change_type {
            ChangeType::Created => &mut self.created,
            ChangeType::Updated => &mut self.updated,
            ChangeType::Deleted => &mut self.deleted,
        }
    }

    fn slot(&self, change_type: ChangeType) -> Option<&ChangeCallback> {
        match change_type {
            ChangeType::Created => self.created.as_ref(),
            ChangeType::Updated => self.updated.as_ref(),
            ChangeType::Deleted => self.deleted.as_ref(),
        }
    }
}

/// Settings for watching one entity.
///
/// Built with chained `with_*` calls before it is handed to a registry or
/// tracker. Nothing is validated here: a bad field name shows up as a remote
/// query error on the first poll.
#[derive(Clone)]
pub struct WatcherConfig {
    /// Entity name, the identity key inside a registry
    pub entity: String,
    pub primary_key: String,
    pub update_field: String,
    /// Not used by detection yet
    pub create_field: String,
    pub detect_created: bool,
    pub detect_updated: bool,
    pub detect_deleted: bool,
    /// Opaque filter expression in the backend's grammar
    pub filter: Option<String>,
    /// Projected fields; empty means all fields
    pub select: Vec<String>,
    pub batch_size: usize,
    /// strftime format used to store the update cursor
    pub timestamp_format: String,
    callbacks: Callbacks,
}

impl WatcherConfig {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            primary_key: DEFAULT_PRIMARY_KEY.to_string(),
            update_field: DEFAULT_UPDATE_FIELD.to_string(),
            create_field: DEFAULT_CREATE_FIELD.to_string(),
            detect_created: true,
            detect_updated: true,
            detect_deleted: false,
            filter: None,
            select: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
            callbacks: Callbacks::default(),
        }
    }

    pub fn with_primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key = field.into();
        self
    }

    pub fn with_update_field(mut self, field: impl Into<String>) -> Self {
        self.update_field = field.into();
        self
    }

    pub fn with_create_field(mut self, field: impl Into<String>) -> Self {
        self.create_field = field.into();
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Fields to project. The primary key is added to queries when missing.
    pub fn with_select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Page size for every query. Zero is raised to one so full scans always
    /// make progress.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_timestamp_format(mut self, format: impl Into<String>) -> Self {
        self.timestamp_format = format.into();
        self
    }

    pub fn detect_created(mut self, enabled: bool) -> Self {
        self.detect_created = enabled;
        self
    }

    pub fn detect_updated(mut self, enabled: bool) -> Self {
        self.detect_updated = enabled;
        self
    }

    /// Deletion detection rescans the whole key space on every poll.
    pub fn detect_deleted(mut self, enabled: bool) -> Self {
        self.detect_deleted = enabled;
        self
    }

    pub fn only_created(mut self) -> Self {
        self.detect_created = true;
        self.detect_updated = false;
        self.detect_deleted = false;
        self
    }

    pub fn only_updated(mut self) -> Self {
        self.detect_created = false;
        self.detect_updated = true;
        self.detect_deleted = false;
        self
    }

    /// Set the callback for one change type, replacing any previous one.
    ///
    /// Callbacks run synchronously on the polling thread after the cursors
    /// are written and the entity lock is released.
    pub fn on<F>(mut self, change_type: ChangeType, callback: F) -> Self
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        *self.callbacks.slot_mut(change_type) = Some(Arc::new(callback));
        self
    }

    pub fn on_created<F>(self, callback: F) -> Self
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        self.on(ChangeType::Created, callback)
    }

    pub fn on_updated<F>(self, callback: F) -> Self
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        self.on(ChangeType::Updated, callback)
    }

    pub fn on_deleted<F>(self, callback: F) -> Self
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        self.on(ChangeType::Deleted, callback)
    }

    /// Callback invoked for every change after the type-specific one.
    pub fn on_any<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        self.callbacks.any = Some(Arc::new(callback));
        self
    }

    pub fn callback(&self, change_type: ChangeType) -> Option<&ChangeCallback> {
        self.callbacks.slot(change_type)
    }

    pub fn any_callback(&self) -> Option<&ChangeCallback> {
        self.callbacks.any.as_ref()
    }

    /// Whether any detection pass is enabled.
    pub fn is_active(&self) -> bool {
        self.detect_created || self.detect_updated || self.detect_deleted
    }
}

impl fmt::Debug for WatcherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<&str> = ChangeType::ALL
            .iter()
            .filter(|t| self.callbacks.slot(**t).is_some())
            .map(|t| t.as_str())
            .chain(self.callbacks.any.as_ref().map(|_| "any"))
            .collect();

        f.debug_struct("WatcherConfig")
            .field("entity", &self.entity)
            .field("primary_key", &self.primary_key)
            .field("update_field", &self.update_field)
            .field("create_field", &self.create_field)
            .field("detect_created", &self.detect_created)
            .field("detect_updated", &self.detect_updated)
            .field("detect_deleted", &self.detect_deleted)
            .field("filter", &self.filter)
            .field("select", &self.select)
            .field("batch_size", &self.batch_size)
            .field("timestamp_format", &self.timestamp_format)
            .field("callbacks", &registered)
            .finish()
    }
}

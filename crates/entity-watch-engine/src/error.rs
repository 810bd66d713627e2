//! Error types for watcher operations.

/// Failure of a poll or reset.
///
/// All variants are equally severe; the engine never retries. Cursors written
/// by passes that finished before the failure stay written.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The remote query failed, including rejections caused by a bad
    /// filter or field name in the watcher configuration.
    #[error("Remote query for {entity} failed: {source}")]
    Remote {
        entity: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("State store operation for {entity} failed: {source}")]
    Store {
        entity: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Record from {entity} has no usable primary key in field {field}")]
    MissingPrimaryKey { entity: String, field: String },

    #[error("Timestamp format {format:?} for {entity} cannot be rendered")]
    InvalidTimestampFormat { entity: String, format: String },
}

impl WatchError {
    pub fn remote(entity: &str, source: anyhow::Error) -> Self {
        WatchError::Remote {
            entity: entity.to_string(),
            source,
        }
    }

    pub fn store(entity: &str, source: anyhow::Error) -> Self {
        WatchError::Store {
            entity: entity.to_string(),
            source,
        }
    }

    /// Entity the failure belongs to.
    pub fn entity(&self) -> &str {
        match self {
            WatchError::Remote { entity, .. }
            | WatchError::Store { entity, .. }
            | WatchError::MissingPrimaryKey { entity, .. }
            | WatchError::InvalidTimestampFormat { entity, .. } => entity,
        }
    }
}

pub type Result<T> = std::result::Result<T, WatchError>;

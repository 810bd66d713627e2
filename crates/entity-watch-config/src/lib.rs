//! Configuration loading and durable state storage for entity-watch.

pub mod config;
pub mod persistence;

pub use config::{
    AppConfig, ConfigError, EntityConfig, PollConfig, RemoteConfig, StateConfig,
};
pub use persistence::{Persistence, StateEntry};

//! Application configuration loaded from TOML.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use entity_watch_engine::{WatcherConfig, DEFAULT_BATCH_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

const CONFIG_FILE: &str = "config.toml";
const STATE_FILE: &str = "state.duckdb";

pub const ENV_BASE_URL: &str = "ENTITY_WATCH_BASE_URL";
pub const ENV_STATE_PATH: &str = "ENTITY_WATCH_STATE_PATH";
pub const ENV_INTERVAL_SECS: &str = "ENTITY_WATCH_INTERVAL_SECS";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Entity names must not be empty")]
    EmptyEntityName,

    #[error("Entity {0} is configured more than once")]
    DuplicateEntity(String),

    #[error("Poll interval must be at least one second")]
    ZeroInterval,

    #[error("No remote base_url configured (set [remote].base_url or ENTITY_WATCH_BASE_URL)")]
    MissingBaseUrl,

    #[error("Could not determine a platform directory for {0}")]
    NoProjectDirs(&'static str),
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
}

/// Connection settings for the remote entity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Sent verbatim as the `Cookie` header
    #[serde(default)]
    pub session_cookie: Option<String>,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: default_timeout_secs(),
            username: None,
            password: None,
            session_cookie: None,
            accept_invalid_certs: false,
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

/// Where watcher cursors are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// DuckDB file; defaults to the platform data directory
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Prefix for every state key
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: None,
            namespace: default_namespace(),
        }
    }
}

fn default_namespace() -> String {
    entity_watch_engine::store::DEFAULT_NAMESPACE.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    60
}

/// One `[[entities]]` table. Unset fields fall back to the watcher defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    #[serde(default)]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub update_field: Option<String>,
    #[serde(default)]
    pub create_field: Option<String>,
    #[serde(default)]
    pub detect_created: Option<bool>,
    #[serde(default)]
    pub detect_updated: Option<bool>,
    #[serde(default)]
    pub detect_deleted: Option<bool>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub select: Option<Vec<String>>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub timestamp_format: Option<String>,
}

impl EntityConfig {
    pub fn to_watcher_config(&self) -> WatcherConfig {
        let mut config = WatcherConfig::new(&self.name)
            .with_batch_size(self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE));

        if let Some(field) = &self.primary_key {
            config = config.with_primary_key(field);
        }
        if let Some(field) = &self.update_field {
            config = config.with_update_field(field);
        }
        if let Some(field) = &self.create_field {
            config = config.with_create_field(field);
        }
        if let Some(enabled) = self.detect_created {
            config = config.detect_created(enabled);
        }
        if let Some(enabled) = self.detect_updated {
            config = config.detect_updated(enabled);
        }
        if let Some(enabled) = self.detect_deleted {
            config = config.detect_deleted(enabled);
        }
        if let Some(filter) = &self.filter {
            config = config.with_filter(filter);
        }
        if let Some(select) = &self.select {
            config = config.with_select(select.iter().cloned());
        }
        if let Some(format) = &self.timestamp_format {
            config = config.with_timestamp_format(format);
        }
        config
    }
}

impl AppConfig {
    /// Parse, apply environment overrides and validate.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut config: AppConfig =
            toml::from_str(contents).context("Failed to parse configuration TOML")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// Load from `path`, or from the platform default location. A missing
    /// default file yields the default configuration.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("No configuration file found, using defaults");
                let mut config = Self::default();
                config.apply_env_overrides();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Configured state file, or `state.duckdb` in the platform data directory.
    pub fn state_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.state.path {
            return Ok(path.clone());
        }
        let dirs = project_dirs().ok_or(ConfigError::NoProjectDirs("state"))?;
        Ok(dirs.data_dir().join(STATE_FILE))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(ENV_BASE_URL) {
            self.remote.base_url = url;
        }
        if let Ok(path) = std::env::var(ENV_STATE_PATH) {
            self.state.path = Some(PathBuf::from(path));
        }
        if let Ok(secs) = std::env::var(ENV_INTERVAL_SECS) {
            match secs.parse() {
                Ok(secs) => self.poll.interval_secs = secs,
                Err(_) => tracing::warn!("Ignoring invalid {}={}", ENV_INTERVAL_SECS, secs),
            }
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.poll.interval_secs == 0 {
            return Err(ConfigError::ZeroInterval);
        }

        let mut seen = HashSet::new();
        for entity in &self.entities {
            if entity.name.trim().is_empty() {
                return Err(ConfigError::EmptyEntityName);
            }
            if !seen.insert(entity.name.as_str()) {
                return Err(ConfigError::DuplicateEntity(entity.name.clone()));
            }
        }
        Ok(())
    }

    pub fn entity(&self, name: &str) -> Option<&EntityConfig> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn watcher_configs(&self) -> Vec<WatcherConfig> {
        self.entities.iter().map(EntityConfig::to_watcher_config).collect()
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "entity-watch", "entity-watch")
}

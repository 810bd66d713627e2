//! DuckDB-backed durable key/value storage for watcher state.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// A stored state row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Shared handle to the state database. Cloning shares the connection.
#[derive(Clone)]
pub struct Persistence {
    conn: Arc<Mutex<Connection>>,
}

impl Persistence {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create state directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open state database {}", path.display()))?;
        debug!("Opened state database {}", path.display());
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            -- Watcher cursors, kept until explicitly deleted
            CREATE TABLE IF NOT EXISTS watch_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );
            ",
        )
        .context("Failed to initialize state schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("state database connection poisoned"))
    }

    pub fn state_get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT value FROM watch_state WHERE key = ?")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("Corrupt state value for key {}", key))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Insert or replace; the row never expires.
    pub fn state_put(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        let now = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO watch_state (key, value, updated_at) VALUES (?, ?, CAST(? AS TIMESTAMP))",
                params![key, raw, now],
            )
            .with_context(|| format!("Failed to store state key {}", key))?;
        Ok(())
    }

    pub fn state_delete(&self, key: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM watch_state WHERE key = ?", [key])
            .with_context(|| format!("Failed to delete state key {}", key))?;
        Ok(())
    }

    /// All rows whose key starts with `prefix`, ordered by key.
    pub fn state_list(&self, prefix: &str) -> Result<Vec<StateEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, value, CAST(updated_at AS TEXT) FROM watch_state WHERE starts_with(key, ?) ORDER BY key",
        )?;
        let rows = stmt
            .query_map([prefix], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, duckdb::Error>>()
            .context("Querying state entries")?;

        rows.into_iter()
            .map(|(key, raw, updated_at)| {
                Ok(StateEntry {
                    value: serde_json::from_str(&raw)
                        .with_context(|| format!("Corrupt state value for key {}", key))?,
                    updated_at: parse_timestamp(&updated_at)?,
                    key,
                })
            })
            .collect()
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .with_context(|| format!("Invalid state timestamp {}", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn put_get_and_delete() {
        let persistence = Persistence::in_memory().unwrap();

        assert_eq!(persistence.state_get("a").unwrap(), None);

        persistence.state_put("a", &json!([1, "x"])).unwrap();
        persistence.state_put("a", &json!(7)).unwrap();
        assert_eq!(persistence.state_get("a").unwrap(), Some(json!(7)));

        persistence.state_delete("a").unwrap();
        persistence.state_delete("a").unwrap();
        assert_eq!(persistence.state_get("a").unwrap(), None);
    }

    #[test]
    fn lists_by_prefix() {
        let persistence = Persistence::in_memory().unwrap();
        persistence.state_put("ns.Orders.last_primary_key", &json!(5)).unwrap();
        persistence.state_put("ns.Items.last_check_time", &json!("t")).unwrap();
        persistence.state_put("other.Orders", &json!(1)).unwrap();

        let entries = persistence.state_list("ns.").unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["ns.Items.last_check_time", "ns.Orders.last_primary_key"]);
        assert_eq!(entries[1].value, json!(5));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.duckdb");

        {
            let persistence = Persistence::new(&path).unwrap();
            persistence.state_put("k", &json!({"known": [1, 2]})).unwrap();
        }

        let reopened = Persistence::new(&path).unwrap();
        assert_eq!(reopened.state_get("k").unwrap(), Some(json!({"known": [1, 2]})));
    }
}

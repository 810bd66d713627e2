//! Detected mutations of remote records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::key::PrimaryKey;

/// A remote record: field name to value.
pub type Record = Map<String, Value>;

/// Kind of mutation a [`Change`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl ChangeType {
    pub const ALL: [ChangeType; 3] = [ChangeType::Created, ChangeType::Updated, ChangeType::Deleted];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Updated => "updated",
            ChangeType::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected mutation of one record.
///
/// Changes are built once by the tracker and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Unique id, usable as an idempotency key downstream
    pub id: Uuid,
    pub entity: String,
    pub change_type: ChangeType,
    pub key: PrimaryKey,
    /// Snapshot returned by the remote query; empty for deletions
    pub current: Record,
    /// Earlier snapshot, only when one was supplied
    pub previous: Option<Record>,
    pub detected_at: DateTime<Utc>,
}

/// Difference of one field between the previous and current snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl Change {
    fn build(
        entity: impl Into<String>,
        change_type: ChangeType,
        key: PrimaryKey,
        current: Record,
        previous: Option<Record>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            entity: entity.into(),
            change_type,
            key,
            current,
            previous,
            detected_at: Utc::now(),
        }
    }

    pub fn created(entity: impl Into<String>, key: PrimaryKey, current: Record) -> Self {
        Self::build(entity, ChangeType::Created, key, current, None)
    }

    pub fn updated(
        entity: impl Into<String>,
        key: PrimaryKey,
        current: Record,
        previous: Option<Record>,
    ) -> Self {
        Self::build(entity, ChangeType::Updated, key, current, previous)
    }

    pub fn deleted(entity: impl Into<String>, key: PrimaryKey, previous: Option<Record>) -> Self {
        Self::build(entity, ChangeType::Deleted, key, Record::new(), previous)
    }

    pub fn is_created(&self) -> bool {
        self.change_type == ChangeType::Created
    }

    pub fn is_updated(&self) -> bool {
        self.change_type == ChangeType::Updated
    }

    pub fn is_deleted(&self) -> bool {
        self.change_type == ChangeType::Deleted
    }

    /// Per-field differences between `previous` and `current`.
    ///
    /// Created changes report every current field as added and deleted changes
    /// every previous field as removed. An update without a previous snapshot
    /// has nothing to compare against and yields no diffs.
    pub fn diff(&self) -> Vec<FieldDiff> {
        let previous = match (&self.previous, self.change_type) {
            (Some(previous), _) => previous,
            (None, ChangeType::Created) => {
                return self
                    .current
                    .iter()
                    .map(|(field, value)| FieldDiff {
                        field: field.clone(),
                        old: None,
                        new: Some(value.clone()),
                    })
                    .collect();
            }
            (None, _) => return Vec::new(),
        };

        let fields: BTreeSet<&String> = previous.keys().chain(self.current.keys()).collect();
        fields
            .into_iter()
            .filter_map(|field| {
                let old = previous.get(field);
                let new = self.current.get(field);
                if old == new {
                    return None;
                }
                Some(FieldDiff {
                    field: field.clone(),
                    old: old.cloned(),
                    new: new.cloned(),
                })
            })
            .collect()
    }

    /// Whether `field` differs between the two snapshots.
    pub fn field_changed(&self, field: &str) -> bool {
        self.diff().iter().any(|d| d.field == field)
    }
}

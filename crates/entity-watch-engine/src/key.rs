//! Primary key values and the comparison rule used by creation detection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Value of an entity's primary key field.
///
/// Entities use either numeric sequence keys (`DocEntry`) or free-form codes
/// (`ItemCode`, `CardCode`), so both shapes are kept as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Int(i64),
    Str(String),
}

impl PrimaryKey {
    /// Extract a key from a record field value.
    ///
    /// Integers that fit in `i64` stay numeric, any other number or string is
    /// kept as text. Null, booleans, arrays and objects are not usable keys.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) => PrimaryKey::Int(i),
                None => PrimaryKey::Str(n.to_string()),
            }),
            Value::String(s) => Some(PrimaryKey::Str(s.clone())),
            _ => None,
        }
    }

    /// Compare two keys: numerically when both are integers, otherwise
    /// byte-wise on their textual form.
    ///
    /// This is not a total order across mixed key types, which is why
    /// `PrimaryKey` does not implement `Ord`.
    pub fn compare(&self, other: &PrimaryKey) -> Ordering {
        match (self, other) {
            (PrimaryKey::Int(a), PrimaryKey::Int(b)) => a.cmp(b),
            _ => self.to_string().as_bytes().cmp(other.to_string().as_bytes()),
        }
    }

    /// True when `self` sorts strictly after `other`.
    pub fn is_after(&self, other: &PrimaryKey) -> bool {
        self.compare(other) == Ordering::Greater
    }

    pub fn to_value(&self) -> Value {
        match self {
            PrimaryKey::Int(i) => Value::from(*i),
            PrimaryKey::Str(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Int(i) => write!(f, "{}", i),
            PrimaryKey::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        PrimaryKey::Int(value)
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        PrimaryKey::Str(value.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(value: String) -> Self {
        PrimaryKey::Str(value)
    }
}

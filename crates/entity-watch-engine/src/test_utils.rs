//! In-memory remote collection for tests.
//!
//! [`MemoryCollection`] evaluates the structured [`Query`] model the same way a
//! remote backend would: filters, ordering, `top`/`skip` paging and field
//! projection. Raw filter expressions support a single comparison of the form
//! `Field op literal` with `eq`, `ne`, `gt`, `ge`, `lt` or `le`, where the
//! literal is a quoted string, a number or a boolean.

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::change::Record;
use crate::key::PrimaryKey;
use crate::query::{EntityCollection, Filter, Query, SortDirection};

#[derive(Debug, Default)]
pub struct MemoryCollection {
    entities: RwLock<HashMap<String, Vec<Record>>>,
    queries: Mutex<Vec<(String, Query)>>,
    failures: Mutex<HashMap<usize, String>>,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Non-object values are ignored.
    pub fn insert(&self, entity: &str, record: Value) {
        if let Value::Object(record) = record {
            if let Ok(mut entities) = self.entities.write() {
                entities.entry(entity.to_string()).or_default().push(record);
            }
        }
    }

    /// Remove every record whose `field` holds `key`. Returns how many went.
    pub fn remove(&self, entity: &str, field: &str, key: &PrimaryKey) -> usize {
        let Ok(mut entities) = self.entities.write() else {
            return 0;
        };
        let Some(records) = entities.get_mut(entity) else {
            return 0;
        };
        let before = records.len();
        records.retain(|r| r.get(field).and_then(PrimaryKey::from_value).as_ref() != Some(key));
        before - records.len()
    }

    /// Merge `patch` into every record whose `field` holds `key`.
    pub fn update(&self, entity: &str, field: &str, key: &PrimaryKey, patch: Value) {
        let Value::Object(patch) = patch else {
            return;
        };
        if let Ok(mut entities) = self.entities.write() {
            for record in entities.get_mut(entity).into_iter().flatten() {
                if record.get(field).and_then(PrimaryKey::from_value).as_ref() == Some(key) {
                    for (name, value) in &patch {
                        record.insert(name.clone(), value.clone());
                    }
                }
            }
        }
    }

    pub fn len(&self, entity: &str) -> usize {
        self.entities
            .read()
            .map(|e| e.get(entity).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Every query issued so far, in order.
    pub fn queries(&self) -> Vec<(String, Query)> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }

    pub fn clear_queries(&self) {
        if let Ok(mut queries) = self.queries.lock() {
            queries.clear();
        }
    }

    /// Make the query with this position in [`queries`](Self::queries) fail.
    pub fn fail_query(&self, index: usize, message: impl Into<String>) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(index, message.into());
        }
    }
}

impl EntityCollection for MemoryCollection {
    fn query(&self, entity: &str, query: &Query) -> Result<Vec<Record>> {
        let index = {
            let mut queries = self
                .queries
                .lock()
                .map_err(|_| anyhow!("query log poisoned"))?;
            queries.push((entity.to_string(), query.clone()));
            queries.len() - 1
        };

        if let Some(message) = self
            .failures
            .lock()
            .map_err(|_| anyhow!("failure table poisoned"))?
            .remove(&index)
        {
            bail!(message);
        }

        let entities = self
            .entities
            .read()
            .map_err(|_| anyhow!("collection poisoned"))?;
        let mut records = Vec::new();
        for record in entities.get(entity).into_iter().flatten() {
            let keep = match &query.filter {
                Some(filter) => matches(filter, record)?,
                None => true,
            };
            if keep {
                records.push(record.clone());
            }
        }

        if let Some(order) = &query.order_by {
            records.sort_by(|a, b| {
                let ordering = compare_fields(a.get(&order.field), b.get(&order.field));
                match order.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            });
        }

        Ok(records
            .into_iter()
            .skip(query.skip)
            .take(query.top)
            .map(|record| project(record, &query.select))
            .collect())
    }
}

fn project(record: Record, select: &[String]) -> Record {
    if select.is_empty() {
        return record;
    }
    record
        .into_iter()
        .filter(|(field, _)| select.contains(field))
        .collect()
}

fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.and_then(PrimaryKey::from_value);
    let b = b.and_then(PrimaryKey::from_value);
    match (a, b) {
        (Some(a), Some(b)) => a.compare(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn compare_values(field: Option<&Value>, literal: &Value) -> Option<Ordering> {
    match (field?, literal) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn matches(filter: &Filter, record: &Record) -> Result<bool> {
    match filter {
        Filter::AtLeast { field, value } => Ok(matches!(
            compare_values(record.get(field), &Value::String(value.clone())),
            Some(Ordering::Greater | Ordering::Equal)
        )),
        Filter::And(left, right) => Ok(matches(left, record)? && matches(right, record)?),
        Filter::Expression(expr) => {
            let (field, op, literal) = parse_comparison(expr)?;
            let ordering = compare_values(record.get(&field), &literal);
            Ok(match op.as_str() {
                "eq" => ordering == Some(Ordering::Equal),
                "ne" => ordering != Some(Ordering::Equal),
                "gt" => ordering == Some(Ordering::Greater),
                "ge" => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
                "lt" => ordering == Some(Ordering::Less),
                "le" => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                other => bail!("unsupported operator '{}' in filter: {}", other, expr),
            })
        }
    }
}

fn parse_comparison(expr: &str) -> Result<(String, String, Value)> {
    let mut parts = expr.trim().splitn(3, ' ');
    let (Some(field), Some(op), Some(raw)) = (parts.next(), parts.next(), parts.next()) else {
        bail!("unsupported filter: {}", expr);
    };

    let raw = raw.trim();
    let literal = if let Some(quoted) = raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
        Value::String(quoted.replace("''", "'"))
    } else if raw == "true" || raw == "false" {
        Value::Bool(raw == "true")
    } else {
        serde_json::from_str::<serde_json::Number>(raw)
            .map(Value::Number)
            .map_err(|_| anyhow!("unsupported literal '{}' in filter: {}", raw, expr))?
    };

    Ok((field.to_string(), op.to_string(), literal))
}

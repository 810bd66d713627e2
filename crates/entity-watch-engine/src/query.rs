//! Query model for the remote collection and the trait the engine consumes.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::change::Record;

/// Boolean filter over a remote collection.
///
/// Caller-supplied expressions stay opaque; the engine only needs to AND them
/// with its own timestamp bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    /// Raw expression in the backend's filter grammar
    Expression(String),
    /// `field >= value`, inclusive of `value`
    AtLeast { field: String, value: String },
    And(Box<Filter>, Box<Filter>),
}

impl Filter {
    pub fn expression(expr: impl Into<String>) -> Self {
        Filter::Expression(expr.into())
    }

    pub fn at_least(field: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::AtLeast {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn and(self, other: Filter) -> Self {
        Filter::And(Box::new(self), Box::new(other))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Expression(expr) => f.write_str(expr),
            Filter::AtLeast { field, value } => {
                write!(f, "{} ge '{}'", field, value.replace('\'', "''"))
            }
            Filter::And(left, right) => write!(f, "({}) and ({})", left, right),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.direction.as_str())
    }
}

/// One page request: filter, projection, ordering and `top`/`skip` window.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Query {
    pub filter: Option<Filter>,
    /// Fields to return; empty means all fields
    pub select: Vec<String>,
    pub order_by: Option<OrderBy>,
    pub top: usize,
    pub skip: usize,
}

impl Query {
    pub fn new(top: usize) -> Self {
        Self {
            top,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: Option<Filter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_select(mut self, select: Vec<String>) -> Self {
        self.select = select;
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }
}

/// A remote collection of entities that can be queried page by page.
///
/// Implementations own their transport concerns (timeouts, retries, auth).
/// A response without any records, including one that lacks the result
/// array entirely, is an empty page rather than an error.
pub trait EntityCollection: Send + Sync {
    fn query(&self, entity: &str, query: &Query) -> Result<Vec<Record>>;
}

impl<T: EntityCollection + ?Sized> EntityCollection for Arc<T> {
    fn query(&self, entity: &str, query: &Query) -> Result<Vec<Record>> {
        (**self).query(entity, query)
    }
}

impl<T: EntityCollection + ?Sized> EntityCollection for &T {
    fn query(&self, entity: &str, query: &Query) -> Result<Vec<Record>> {
        (**self).query(entity, query)
    }
}

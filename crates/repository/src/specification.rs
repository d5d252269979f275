//! Query intent accepted by repositories.

use std::str::FromStr;

use document_store::{NativeOp, OrderDirection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{RepositoryError, Result};

/// Comparison operator of a domain-level filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    ContainsAny,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Contains => "contains",
            Operator::ContainsAny => "contains_any",
        }
    }

    /// The store operator this translates to.
    pub fn native(&self) -> NativeOp {
        match self {
            Operator::Eq => NativeOp::Equal,
            Operator::Neq => NativeOp::NotEqual,
            Operator::Gt => NativeOp::GreaterThan,
            Operator::Gte => NativeOp::GreaterThanOrEqual,
            Operator::Lt => NativeOp::LessThan,
            Operator::Lte => NativeOp::LessThanOrEqual,
            Operator::In => NativeOp::In,
            Operator::NotIn => NativeOp::NotIn,
            Operator::Contains => NativeOp::ArrayContains,
            Operator::ContainsAny => NativeOp::ArrayContainsAny,
        }
    }
}

impl FromStr for Operator {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "eq" => Operator::Eq,
            "neq" => Operator::Neq,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "in" => Operator::In,
            "not_in" => Operator::NotIn,
            "contains" => Operator::Contains,
            "contains_any" => Operator::ContainsAny,
            other => {
                return Err(RepositoryError::InvalidInput(format!(
                    "unsupported filter operator '{other}'"
                )));
            }
        })
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(field, operator, value)` predicate on a domain field name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Builds a filter from wire strings, rejecting unknown operators.
    pub fn parse(field: impl Into<String>, operator: &str, value: impl Into<Value>) -> Result<Self> {
        Ok(Self::new(field, operator.parse()?, value))
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn native(&self) -> OrderDirection {
        match self {
            Direction::Asc => OrderDirection::Ascending,
            Direction::Desc => OrderDirection::Descending,
        }
    }
}

impl FromStr for Direction {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(Direction::Asc),
            "desc" => Ok(Direction::Desc),
            other => Err(RepositoryError::InvalidInput(format!(
                "unsupported sort direction '{other}'"
            ))),
        }
    }
}

/// A `(field, direction)` ordering on a domain field name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub direction: Direction,
}

impl Sort {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

/// Page window requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Pagination {
    /// Page size used when the caller asks for none.
    pub const DEFAULT_LIMIT: i64 = 20;

    /// Largest page a caller may request.
    pub const MAX_LIMIT: i64 = 100;

    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }

    /// Clamps the window into range. Idempotent.
    pub fn normalize(self) -> Self {
        let limit = if self.limit <= 0 {
            Self::DEFAULT_LIMIT
        } else {
            self.limit.min(Self::MAX_LIMIT)
        };
        Self {
            limit,
            offset: self.offset.max(0),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// Filters, sorts and one pagination window: the only query intent a
/// repository accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    pub filters: Vec<Filter>,
    pub sorts: Vec<Sort>,
    pub pagination: Pagination,
}

impl Specification {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a filter.
    pub fn filter(mut self, field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(field, operator, value));
        self
    }

    /// Adds a sort clause.
    pub fn sort(mut self, sort: Sort) -> Self {
        self.sorts.push(sort);
        self
    }

    /// Sets the pagination window.
    pub fn paginate(mut self, limit: i64, offset: i64) -> Self {
        self.pagination = Pagination::new(limit, offset);
        self
    }
}

/// One page of results.
///
/// `has_more` is true iff at least one more matching row exists past this
/// page; repositories learn it by over-fetching one row, never by counting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub data: Vec<T>,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Converts every item, keeping the window.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            data: self.data.into_iter().map(f).collect(),
            limit: self.limit,
            offset: self.offset,
            has_more: self.has_more,
        }
    }
}

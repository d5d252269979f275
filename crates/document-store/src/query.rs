use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Fields, Result, StoreError};

/// Native comparison operators understood by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NativeOp {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessThanOrEqual,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not-in")]
    NotIn,
    #[serde(rename = "array-contains")]
    ArrayContains,
    #[serde(rename = "array-contains-any")]
    ArrayContainsAny,
}

impl NativeOp {
    /// Returns true for operators whose operand must be an array.
    pub fn takes_array(&self) -> bool {
        matches!(
            self,
            NativeOp::In | NativeOp::NotIn | NativeOp::ArrayContainsAny
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NativeOp::Equal => "==",
            NativeOp::NotEqual => "!=",
            NativeOp::GreaterThan => ">",
            NativeOp::GreaterThanOrEqual => ">=",
            NativeOp::LessThan => "<",
            NativeOp::LessThanOrEqual => "<=",
            NativeOp::In => "in",
            NativeOp::NotIn => "not-in",
            NativeOp::ArrayContains => "array-contains",
            NativeOp::ArrayContainsAny => "array-contains-any",
        }
    }
}

impl std::fmt::Display for NativeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `field op value` predicate in store terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub op: NativeOp,
    pub value: Value,
}

impl FieldFilter {
    pub fn new(field: impl Into<String>, op: NativeOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// Evaluates the predicate against a document body.
    ///
    /// Documents that do not carry the field never match, including for
    /// `!=` and `not-in`.
    pub fn matches(&self, fields: &Fields) -> bool {
        let Some(actual) = fields.get(&self.field) else {
            return false;
        };

        match self.op {
            NativeOp::Equal => values_equal(actual, &self.value),
            NativeOp::NotEqual => !values_equal(actual, &self.value),
            NativeOp::GreaterThan => compare_values(actual, &self.value) == Some(Ordering::Greater),
            NativeOp::GreaterThanOrEqual => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            NativeOp::LessThan => compare_values(actual, &self.value) == Some(Ordering::Less),
            NativeOp::LessThanOrEqual => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            NativeOp::In => as_array(&self.value)
                .iter()
                .any(|candidate| values_equal(actual, candidate)),
            NativeOp::NotIn => !as_array(&self.value)
                .iter()
                .any(|candidate| values_equal(actual, candidate)),
            NativeOp::ArrayContains => as_array(actual)
                .iter()
                .any(|element| values_equal(element, &self.value)),
            NativeOp::ArrayContainsAny => {
                let elements = as_array(actual);
                as_array(&self.value)
                    .iter()
                    .any(|candidate| elements.iter().any(|e| values_equal(e, candidate)))
            }
        }
    }
}

/// Sort direction for an ordering clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

/// A single ordering clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: OrderDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: OrderDirection::Ascending,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: OrderDirection::Descending,
        }
    }
}

/// Builder for constructing native store queries.
///
/// Filters are combined with AND. Documents missing an ordered field are
/// excluded from ordered results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// The collection to query.
    pub collection: String,

    /// Predicates, all of which must hold.
    pub filters: Vec<FieldFilter>,

    /// Ordering clauses, applied in sequence.
    pub order_by: Vec<OrderBy>,

    /// Maximum number of documents to return.
    pub limit: Option<usize>,

    /// Number of documents to skip.
    pub offset: usize,
}

impl Query {
    /// Creates an unfiltered query over a collection.
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Default::default()
        }
    }

    /// Adds a predicate.
    pub fn filter(mut self, field: impl Into<String>, op: NativeOp, value: Value) -> Self {
        self.filters.push(FieldFilter::new(field, op, value));
        self
    }

    /// Adds several predicates.
    pub fn filters(mut self, filters: impl IntoIterator<Item = FieldFilter>) -> Self {
        self.filters.extend(filters);
        self
    }

    /// Adds an ordering clause.
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Removes all ordering clauses.
    pub fn without_order(mut self) -> Self {
        self.order_by.clear();
        self
    }

    /// Limits the number of documents returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips this many documents before returning results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Checks operand shapes before the query reaches a backend.
    pub fn validate(&self) -> Result<()> {
        if self.collection.is_empty() {
            return Err(StoreError::InvalidArgument(
                "query has no collection".to_string(),
            ));
        }
        for filter in &self.filters {
            if filter.op.takes_array() && !filter.value.is_array() {
                return Err(StoreError::InvalidArgument(format!(
                    "operator '{}' on field '{}' requires an array operand",
                    filter.op, filter.field
                )));
            }
        }
        Ok(())
    }

    /// Returns true if the query both filters and orders, which is the shape
    /// that needs a composite index on index-backed stores.
    pub fn needs_composite_index(&self) -> bool {
        if self.filters.is_empty() || self.order_by.is_empty() {
            return false;
        }
        let ordered_only_on_filtered = self
            .order_by
            .iter()
            .all(|o| self.filters.iter().any(|f| f.field == o.field));
        !(self.order_by.len() == 1 && ordered_only_on_filtered)
    }

    /// The field set a composite index must cover for this query.
    pub fn index_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        for f in &self.filters {
            if !fields.contains(&f.field) {
                fields.push(f.field.clone());
            }
        }
        for o in &self.order_by {
            if !fields.contains(&o.field) {
                fields.push(o.field.clone());
            }
        }
        fields
    }

    /// Orders two documents by this query's ordering clauses.
    pub fn compare_documents(&self, a: &Fields, b: &Fields) -> Ordering {
        for order in &self.order_by {
            let ordering = match (a.get(&order.field), b.get(&order.field)) {
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = match order.direction {
                OrderDirection::Ascending => ordering,
                OrderDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Returns true if a document carries every ordered field.
    pub fn has_order_fields(&self, fields: &Fields) -> bool {
        self.order_by.iter().all(|o| fields.contains_key(&o.field))
    }
}

fn as_array(value: &Value) -> &[Value] {
    value.as_array().map(Vec::as_slice).unwrap_or(&[])
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Compares two scalar values of the same type. Mixed types are unordered.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

//! Translation from domain field names to storage fields.
//!
//! Each entity describes its own fields in a table of [`FieldSpec`]s and
//! composes it with [`BaseFieldMapper`], which covers the fields every entity
//! carries (identity, creator, timestamps, soft-delete flag, parent).
//!
//! Filters and sorts on unknown fields are dropped so callers can send the
//! same query shape to entities that support different fields. Updates on
//! unknown fields are rejected.

use std::collections::BTreeMap;

use document_store::{FieldFilter, Fields, OrderBy};
use serde_json::Value;

use crate::{Filter, RepositoryError, Result, Sort};

/// Update keys that would touch the creation timestamp. They are dropped
/// silently so `created_at` is written exactly once.
const CREATED_AT_KEYS: &[&str] = &["createdAt", "created_at", "CreatedAt"];

/// Keys that are always stamped by the repository and never taken from callers.
const MANAGED_KEYS: &[&str] = &["id", "ID", "Id", "updatedAt", "updated_at", "UpdatedAt"];

/// Storage type of a field, used to validate update values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Float,
    Bool,
    /// RFC 3339 string, re-encoded at fixed precision.
    Timestamp,
    StringList,
    /// Any JSON value.
    Json,
}

impl FieldKind {
    fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Float => "number",
            FieldKind::Bool => "boolean",
            FieldKind::Timestamp => "RFC 3339 timestamp",
            FieldKind::StringList => "list of strings",
            FieldKind::Json => "JSON value",
        }
    }
}

/// One row of a field table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Name callers use.
    pub domain: &'static str,
    /// Name in the stored document.
    pub storage: &'static str,
    pub kind: FieldKind,
    /// Whether `null` is an acceptable update value.
    pub nullable: bool,
}

impl FieldSpec {
    pub const fn new(domain: &'static str, storage: &'static str, kind: FieldKind) -> Self {
        Self {
            domain,
            storage,
            kind,
            nullable: false,
        }
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Checks a value against this field's kind and returns its stored form.
    ///
    /// `null` stands for an absent optional value and is accepted only for
    /// nullable fields.
    pub fn coerce(&self, value: &Value) -> Result<Value> {
        if value.is_null() {
            return if self.nullable {
                Ok(Value::Null)
            } else {
                Err(RepositoryError::validation(self.domain, "field is not nullable"))
            };
        }

        let mismatch = || {
            RepositoryError::validation(self.domain, format!("expected {}", self.kind.name()))
        };

        match self.kind {
            FieldKind::String if value.is_string() => Ok(value.clone()),
            FieldKind::Integer if value.is_i64() || value.is_u64() => Ok(value.clone()),
            FieldKind::Float if value.is_number() => Ok(value.clone()),
            FieldKind::Bool if value.is_boolean() => Ok(value.clone()),
            FieldKind::Timestamp => {
                let raw = value.as_str().ok_or_else(mismatch)?;
                let parsed = common::timestamp::parse(raw).map_err(|_| mismatch())?;
                Ok(Value::String(common::timestamp::encode(&parsed)))
            }
            FieldKind::StringList
                if value
                    .as_array()
                    .is_some_and(|items| items.iter().all(Value::is_string)) =>
            {
                Ok(value.clone())
            }
            FieldKind::Json => Ok(value.clone()),
            _ => Err(mismatch()),
        }
    }
}

/// Partial update keyed by domain field names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateMap {
    values: BTreeMap<String, Value>,
}

impl UpdateMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field to a value.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    /// Sets a field from an optional value; `None` clears a nullable field.
    pub fn set_optional<V: Into<Value>>(mut self, field: impl Into<String>, value: Option<V>) -> Self {
        self.values
            .insert(field.into(), value.map_or(Value::Null, Into::into));
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.values.insert(field.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

impl FromIterator<(String, Value)> for UpdateMap {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl From<serde_json::Map<String, Value>> for UpdateMap {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        map.into_iter().collect()
    }
}

/// Translates domain filters, sorts and updates into storage terms.
pub trait FieldMapper: Send + Sync {
    /// Finds the table row for a domain field name.
    fn lookup(&self, domain_field: &str) -> Option<&FieldSpec>;

    /// Maps filters. Filters on unknown fields are dropped.
    fn map_filters(&self, filters: &[Filter]) -> Result<Vec<FieldFilter>> {
        let mut mapped = Vec::with_capacity(filters.len());
        for filter in filters {
            let Some(spec) = self.lookup(&filter.field) else {
                tracing::debug!(field = %filter.field, "dropping filter on unsupported field");
                continue;
            };
            let op = filter.operator.native();
            let value = if op.takes_array() {
                let items = filter.value.as_array().ok_or_else(|| {
                    RepositoryError::InvalidInput(format!(
                        "operator '{}' on field '{}' requires a list value",
                        filter.operator, filter.field
                    ))
                })?;
                Value::Array(items.iter().map(|v| filter_value(spec, v)).collect())
            } else {
                filter_value(spec, &filter.value)
            };
            mapped.push(FieldFilter::new(spec.storage, op, value));
        }
        Ok(mapped)
    }

    /// Maps sorts. Sorts on unknown fields are dropped.
    fn map_sorts(&self, sorts: &[Sort]) -> Vec<OrderBy> {
        sorts
            .iter()
            .filter_map(|sort| {
                let spec = self.lookup(&sort.field)?;
                Some(OrderBy {
                    field: spec.storage.to_string(),
                    direction: sort.direction.native(),
                })
            })
            .collect()
    }

    /// Maps a partial update. Unknown fields are rejected; creation-time and
    /// repository-managed keys are dropped.
    fn map_updates(&self, updates: &UpdateMap) -> Result<Fields> {
        let mut fields = Fields::new();
        for (key, value) in updates.iter() {
            if CREATED_AT_KEYS.contains(&key.as_str()) || MANAGED_KEYS.contains(&key.as_str()) {
                continue;
            }
            let spec = self.lookup(key).ok_or_else(|| {
                RepositoryError::InvalidInput(format!("invalid type: unknown field '{key}'"))
            })?;
            fields.insert(spec.storage.to_string(), spec.coerce(value)?);
        }
        Ok(fields)
    }
}

/// Timestamp filter operands are re-encoded so they compare correctly
/// against stored values; anything else passes through.
fn filter_value(spec: &FieldSpec, value: &Value) -> Value {
    if spec.kind == FieldKind::Timestamp
        && let Some(parsed) = value.as_str().and_then(|raw| common::timestamp::parse(raw).ok())
    {
        return Value::String(common::timestamp::encode(&parsed));
    }
    value.clone()
}

const BASE_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("id", "id", FieldKind::String),
    FieldSpec::new("createdBy", "created_by", FieldKind::String),
    FieldSpec::new("createdAt", "created_at", FieldKind::Timestamp),
    FieldSpec::new("updatedAt", "updated_at", FieldKind::Timestamp),
    FieldSpec::new("deleted", "deleted", FieldKind::Bool),
    FieldSpec::new("parentId", "parent_id", FieldKind::String).nullable(),
    FieldSpec::new("parentKind", "parent_kind", FieldKind::String).nullable(),
];

/// Mapper for the fields every entity carries.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseFieldMapper;

impl FieldMapper for BaseFieldMapper {
    fn lookup(&self, domain_field: &str) -> Option<&FieldSpec> {
        BASE_FIELDS.iter().find(|spec| spec.domain == domain_field)
    }
}

/// An entity's own field table layered over [`BaseFieldMapper`].
#[derive(Debug, Clone, Default)]
pub struct EntityFieldMapper {
    base: BaseFieldMapper,
    fields: Vec<FieldSpec>,
}

impl EntityFieldMapper {
    pub fn new(fields: impl IntoIterator<Item = FieldSpec>) -> Self {
        Self {
            base: BaseFieldMapper,
            fields: fields.into_iter().collect(),
        }
    }
}

impl FieldMapper for EntityFieldMapper {
    fn lookup(&self, domain_field: &str) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|spec| spec.domain == domain_field)
            .or_else(|| self.base.lookup(domain_field))
    }
}

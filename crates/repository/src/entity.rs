//! Entity trait, shared metadata and document codecs.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use common::{EntityId, ParentRef};
use document_store::{Document, Fields};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{RepositoryError, Result};

/// Fields every persisted entity carries.
///
/// Flattened into each entity's stored document, so the storage names here
/// are the ones [`crate::BaseFieldMapper`] maps to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMeta {
    #[serde(default)]
    pub id: EntityId,

    #[serde(default)]
    pub created_by: String,

    #[serde(with = "common::timestamp")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "common::timestamp")]
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub deleted: bool,

    #[serde(default)]
    pub parent_id: Option<EntityId>,

    #[serde(default)]
    pub parent_kind: Option<String>,
}

impl EntityMeta {
    /// Metadata for an entity that has not been persisted yet.
    pub fn new(created_by: impl Into<String>) -> Self {
        let now = common::timestamp::now();
        Self {
            id: EntityId::default(),
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            deleted: false,
            parent_id: None,
            parent_kind: None,
        }
    }

    /// Sets the owning entity.
    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent_id = Some(parent.id);
        self.parent_kind = Some(parent.kind);
        self
    }

    /// Returns the owning entity, if any.
    pub fn parent(&self) -> Option<ParentRef> {
        match (&self.parent_id, &self.parent_kind) {
            (Some(id), Some(kind)) => Some(ParentRef::new(id.clone(), kind.clone())),
            _ => None,
        }
    }
}

/// A persisted aggregate stored in one document collection.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Collection holding this entity's documents.
    const COLLECTION: &'static str;

    /// Storage field that holds a unique name, for entities that have one.
    const UNIQUE_NAME_FIELD: Option<&'static str> = None;

    fn meta(&self) -> &EntityMeta;

    fn meta_mut(&mut self) -> &mut EntityMeta;

    fn id(&self) -> &EntityId {
        &self.meta().id
    }
}

/// Encodes entities to document bodies and back.
pub trait EntityCodec<E>: Send + Sync {
    fn encode(&self, entity: &E) -> Result<Fields>;

    fn decode(&self, document: Document) -> Result<E>;
}

/// Codec for entities whose serde representation is their stored form.
pub struct JsonCodec<E> {
    _entity: PhantomData<fn() -> E>,
}

impl<E> JsonCodec<E> {
    pub fn new() -> Self {
        Self {
            _entity: PhantomData,
        }
    }
}

impl<E> Default for JsonCodec<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EntityCodec<E> for JsonCodec<E>
where
    E: Serialize + DeserializeOwned,
{
    fn encode(&self, entity: &E) -> Result<Fields> {
        match serde_json::to_value(entity) {
            Ok(Value::Object(fields)) => Ok(fields),
            Ok(other) => Err(RepositoryError::Internal(format!(
                "entity encoded to a non-object value: {other}"
            ))),
            Err(e) => Err(RepositoryError::Internal(format!("failed to encode entity: {e}"))),
        }
    }

    fn decode(&self, document: Document) -> Result<E> {
        let Document { id, mut fields, .. } = document;
        fields.insert("id".to_string(), Value::String(id.clone()));
        serde_json::from_value(Value::Object(fields))
            .map_err(|e| RepositoryError::Internal(format!("failed to decode document {id}: {e}")))
    }
}

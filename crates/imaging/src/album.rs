//! Album entity.

use std::sync::Arc;

use document_store::DocumentStore;
use repository::{Entity, EntityFieldMapper, EntityMeta, FieldKind, FieldSpec, Repository};
use serde::{Deserialize, Serialize};

/// Owner kind recorded on images that belong to an album.
pub const ALBUM_KIND: &str = "album";

/// A named collection of images. Names are unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Album {
    #[serde(flatten)]
    pub meta: EntityMeta,

    pub name: String,

    #[serde(default)]
    pub description: Option<String>,
}

impl Album {
    pub fn new(created_by: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            meta: EntityMeta::new(created_by),
            name: name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Entity for Album {
    const COLLECTION: &'static str = "albums";
    const UNIQUE_NAME_FIELD: Option<&'static str> = Some("name");

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

pub fn album_mapper() -> EntityFieldMapper {
    EntityFieldMapper::new([
        FieldSpec::new("name", "name", FieldKind::String),
        FieldSpec::new("description", "description", FieldKind::String).nullable(),
    ])
}

pub fn album_repository(store: Arc<dyn DocumentStore>) -> Repository<Album> {
    Repository::json(store, Arc::new(album_mapper()))
}

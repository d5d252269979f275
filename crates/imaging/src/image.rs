//! Image entity and its field table.

use std::str::FromStr;
use std::sync::Arc;

use common::{EntityId, ParentRef};
use document_store::DocumentStore;
use repository::{
    Entity, EntityFieldMapper, EntityMeta, FieldKind, FieldSpec, Repository, RepositoryError,
    UpdateMap,
};
use serde::{Deserialize, Serialize};

use crate::album::ALBUM_KIND;

/// Where an image is in its upload/processing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    /// Registered; the client has not finished uploading the original.
    Uploading,
    Uploaded,
    Processing,
    Processed,
    Failed,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Uploading => "UPLOADING",
            ImageStatus::Uploaded => "UPLOADED",
            ImageStatus::Processing => "PROCESSING",
            ImageStatus::Processed => "PROCESSED",
            ImageStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for ImageStatus {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UPLOADING" => Ok(ImageStatus::Uploading),
            "UPLOADED" => Ok(ImageStatus::Uploaded),
            "PROCESSING" => Ok(ImageStatus::Processing),
            "PROCESSED" => Ok(ImageStatus::Processed),
            "FAILED" => Ok(ImageStatus::Failed),
            other => Err(RepositoryError::InvalidInput(format!(
                "unknown image status '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded picture, optionally owned by an album.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    #[serde(flatten)]
    pub meta: EntityMeta,

    pub name: String,

    pub content_type: String,

    pub size_bytes: i64,

    /// Object-storage key of the original upload.
    pub storage_key: String,

    pub status: ImageStatus,

    /// Object-storage keys of processed renditions.
    #[serde(default)]
    pub variant_keys: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl Image {
    /// A freshly registered image awaiting its upload.
    pub fn new(
        created_by: impl Into<String>,
        name: impl Into<String>,
        content_type: impl Into<String>,
        size_bytes: i64,
    ) -> Self {
        let id = EntityId::new();
        let mut meta = EntityMeta::new(created_by);
        let storage_key = original_key(&id);
        meta.id = id;
        Self {
            meta,
            name: name.into(),
            content_type: content_type.into(),
            size_bytes,
            storage_key,
            status: ImageStatus::Uploading,
            variant_keys: Vec::new(),
            tags: Vec::new(),
            failure_reason: None,
        }
    }

    pub fn in_album(mut self, album_id: EntityId) -> Self {
        self.meta = self.meta.with_parent(ParentRef::new(album_id, ALBUM_KIND));
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn album_id(&self) -> Option<&EntityId> {
        self.meta.parent_id.as_ref()
    }
}

impl Entity for Image {
    const COLLECTION: &'static str = "images";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// Storage prefix under which every object of an image lives.
pub fn storage_prefix(image_id: &EntityId) -> String {
    format!("images/{image_id}/")
}

fn original_key(image_id: &EntityId) -> String {
    format!("{}original", storage_prefix(image_id))
}

const IMAGE_FIELDS: [FieldSpec; 9] = [
    FieldSpec::new("name", "name", FieldKind::String),
    FieldSpec::new("contentType", "content_type", FieldKind::String),
    FieldSpec::new("sizeBytes", "size_bytes", FieldKind::Integer),
    FieldSpec::new("storageKey", "storage_key", FieldKind::String),
    FieldSpec::new("status", "status", FieldKind::String),
    FieldSpec::new("variantKeys", "variant_keys", FieldKind::StringList),
    FieldSpec::new("tags", "tags", FieldKind::StringList),
    FieldSpec::new("failureReason", "failure_reason", FieldKind::String).nullable(),
    FieldSpec::new("albumId", "parent_id", FieldKind::String).nullable(),
];

pub fn image_mapper() -> EntityFieldMapper {
    EntityFieldMapper::new(IMAGE_FIELDS)
}

pub fn image_repository(store: Arc<dyn DocumentStore>) -> Repository<Image> {
    Repository::json(store, Arc::new(image_mapper()))
}

/// Update that moves an image to `status`, clearing any failure reason.
pub fn status_update(status: ImageStatus) -> UpdateMap {
    UpdateMap::new()
        .set("status", status.as_str())
        .set_optional("failureReason", None::<String>)
}

/// Update that marks an image failed with `reason`.
pub fn failure_update(reason: impl Into<String>) -> UpdateMap {
    UpdateMap::new()
        .set("status", ImageStatus::Failed.as_str())
        .set("failureReason", reason.into())
}

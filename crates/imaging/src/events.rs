//! Image domain events and the topics they travel on.

use common::EntityId;
use event_pipeline::DomainEvent;
use serde::{Deserialize, Serialize};

pub const IMAGE_UPLOADED_TOPIC: &str = "images.uploaded";
pub const PROCESSING_REQUESTED_TOPIC: &str = "images.processing-requested";
pub const PROCESSING_COMPLETED_TOPIC: &str = "images.processing-completed";

/// The original upload landed in object storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUploaded {
    #[serde(rename = "imageID")]
    pub image_id: EntityId,
    pub storage_key: String,
}

/// Someone asked for renditions of an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageProcessingRequested {
    #[serde(rename = "imageID")]
    pub image_id: EntityId,
}

/// The batch worker finished with an image, successfully or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageProcessingCompleted {
    #[serde(rename = "imageID")]
    pub image_id: EntityId,
    pub success: bool,
    #[serde(default)]
    pub variant_keys: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DomainEvent for ImageUploaded {
    fn event_type(&self) -> &'static str {
        "ImageUploaded"
    }

    fn ordering_key(&self) -> Option<String> {
        Some(self.image_id.to_string())
    }
}

impl DomainEvent for ImageProcessingRequested {
    fn event_type(&self) -> &'static str {
        "ImageProcessingRequested"
    }

    fn ordering_key(&self) -> Option<String> {
        Some(self.image_id.to_string())
    }
}

impl DomainEvent for ImageProcessingCompleted {
    fn event_type(&self) -> &'static str {
        "ImageProcessingCompleted"
    }

    fn ordering_key(&self) -> Option<String> {
        Some(self.image_id.to_string())
    }
}

/// Event type to topic routing for the publisher.
pub fn topic_table() -> [(&'static str, &'static str); 3] {
    [
        ("ImageUploaded", IMAGE_UPLOADED_TOPIC),
        ("ImageProcessingRequested", PROCESSING_REQUESTED_TOPIC),
        ("ImageProcessingCompleted", PROCESSING_COMPLETED_TOPIC),
    ]
}

//! Image and album domain.
//!
//! Images are registered before upload, confirmed when the original lands
//! in object storage, and processed by an external batch worker:
//!
//! 1. `ImageUploaded` marks the image `Uploaded` and requests processing
//! 2. `ImageProcessingRequested` marks it `Processing` and triggers the job
//! 3. `ImageProcessingCompleted` records `Processed` or `Failed`

pub mod album;
pub mod batch;
pub mod error;
pub mod events;
pub mod handlers;
pub mod image;
pub mod service;
pub mod storage;

pub use album::{ALBUM_KIND, Album, album_mapper, album_repository};
pub use batch::{BatchJobRunner, InMemoryBatchJobRunner, JobExecution};
pub use error::{ImagingError, Result};
pub use events::{
    IMAGE_UPLOADED_TOPIC, ImageProcessingCompleted, ImageProcessingRequested, ImageUploaded,
    PROCESSING_COMPLETED_TOPIC, PROCESSING_REQUESTED_TOPIC, topic_table,
};
pub use handlers::{
    HandlerContext, ProcessingRequestedHandler, ProcessingResultHandler, SUBSCRIPTIONS,
    UploadStatusHandler, register_handlers,
};
pub use image::{Image, ImageStatus, image_mapper, image_repository};
pub use service::{ImageService, NewImage};
pub use storage::{InMemoryObjectStorage, ObjectStorage};

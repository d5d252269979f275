//! Application service for images and albums.

use std::sync::Arc;

use common::EntityId;
use document_store::{DocumentStore, MAX_TRANSACTION_WRITES};
use event_pipeline::EventPublisher;
use repository::{Operator, Page, Repository, RepositoryError, Specification, UnitOfWork};

use crate::album::{Album, album_repository};
use crate::error::{ImagingError, Result};
use crate::events::ImageProcessingRequested;
use crate::image::{Image, ImageStatus, image_repository, storage_prefix};
use crate::storage::ObjectStorage;

/// Images deleted per transaction when an album is deleted, leaving one write
/// for the album itself.
const ALBUM_DELETE_CHUNK: usize = MAX_TRANSACTION_WRITES - 1;

/// Input for registering an upload.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub created_by: String,
    pub name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub album_id: Option<EntityId>,
    pub tags: Vec<String>,
}

/// Use cases over images and albums.
#[derive(Clone)]
pub struct ImageService {
    images: Repository<Image>,
    albums: Repository<Album>,
    uow: UnitOfWork,
    storage: Arc<dyn ObjectStorage>,
    publisher: EventPublisher,
}

impl ImageService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        storage: Arc<dyn ObjectStorage>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            images: image_repository(Arc::clone(&store)),
            albums: album_repository(Arc::clone(&store)),
            uow: UnitOfWork::new(store),
            storage,
            publisher,
        }
    }

    pub fn images(&self) -> &Repository<Image> {
        &self.images
    }

    pub fn albums(&self) -> &Repository<Album> {
        &self.albums
    }

    /// Records a new image awaiting upload. The returned image carries the
    /// storage key the client uploads to.
    #[tracing::instrument(skip(self, new), fields(name = %new.name))]
    pub async fn register_upload(&self, new: NewImage) -> Result<Image> {
        let mut image = Image::new(new.created_by, new.name, new.content_type, new.size_bytes)
            .with_tags(new.tags);
        if let Some(album_id) = new.album_id {
            self.albums.read(&album_id).await?;
            image = image.in_album(album_id);
        }

        let image = self.images.create(image).await?;
        tracing::info!(image_id = %image.meta.id, "upload registered");
        Ok(image)
    }

    /// Asks the batch worker to process an uploaded image. Returns the
    /// published message ID.
    #[tracing::instrument(skip(self))]
    pub async fn request_processing(&self, image_id: &EntityId) -> Result<String> {
        let image = self.images.read(image_id).await?;
        if image.status == ImageStatus::Uploading {
            return Err(ImagingError::InvalidState {
                expected: "uploaded",
                actual: image.status,
            });
        }

        let message_id = self
            .publisher
            .publish(&ImageProcessingRequested {
                image_id: image_id.clone(),
            })
            .await?;
        Ok(message_id)
    }

    pub async fn get_image(&self, image_id: &EntityId) -> Result<Image> {
        Ok(self.images.read(image_id).await?)
    }

    /// Lists images that are not soft-deleted.
    ///
    /// If the store cannot combine the filters with the requested order, the
    /// page comes back filtered but unsorted.
    pub async fn list_images(&self, spec: Specification) -> Result<Page<Image>> {
        let spec = spec.filter("deleted", Operator::Eq, false);
        Ok(self.images.find_by_specification(&spec).await?)
    }

    /// Moves images into `album_id` atomically.
    #[tracing::instrument(skip(self, image_ids), fields(count = image_ids.len()))]
    pub async fn move_images(&self, image_ids: &[EntityId], album_id: &EntityId) -> Result<usize> {
        self.albums.read(album_id).await?;

        let moved = self
            .uow
            .with_transaction(&(self.images.clone(),), |(images,)| async move {
                images.batch_transfer(image_ids, album_id).await
            })
            .await?;
        tracing::info!(moved, "images moved");
        Ok(moved)
    }

    /// Deletes an album and every image in it.
    ///
    /// Each transaction re-reads the album's remaining images and deletes up
    /// to `ALBUM_DELETE_CHUNK` of them; the album goes in the last one. If a
    /// chunk fails the album keeps its remaining images, so deleting it again
    /// finishes the job. Stored objects are removed after each chunk commits,
    /// and a storage failure there is logged rather than returned since the
    /// records are already gone.
    #[tracing::instrument(skip(self))]
    pub async fn delete_album(&self, album_id: &EntityId) -> Result<usize> {
        let spec = Specification::new().filter("albumId", Operator::Eq, album_id.as_str());
        let mut deleted = 0;

        loop {
            let (image_ids, finished) = self
                .uow
                .with_transaction(
                    &(self.images.clone(), self.albums.clone()),
                    |(images, albums)| {
                        let spec = &spec;
                        async move {
                            albums.read(album_id).await?;
                            let mut image_ids = images.find_all_ids(spec).await?;
                            let finished = image_ids.len() <= ALBUM_DELETE_CHUNK;
                            image_ids.truncate(ALBUM_DELETE_CHUNK);
                            images.batch_delete(&image_ids).await?;
                            if finished {
                                albums.delete(album_id).await?;
                            }
                            Ok::<_, RepositoryError>((image_ids, finished))
                        }
                    },
                )
                .await?;

            for image_id in &image_ids {
                if let Err(e) = self.storage.delete_by_prefix(&storage_prefix(image_id)).await {
                    tracing::warn!(image_id = %image_id, error = %e, "failed to delete stored objects");
                }
            }
            deleted += image_ids.len();

            if finished {
                break;
            }
            tracing::debug!(deleted, "album images deleted, continuing");
        }

        tracing::info!(images = deleted, "album deleted");
        Ok(deleted)
    }

    /// Creates an album. Names are unique; the lookup and the insert share a
    /// transaction, so of two racing creates with one name, one aborts.
    #[tracing::instrument(skip(self))]
    pub async fn create_album(&self, created_by: &str, name: &str) -> Result<Album> {
        let album = self
            .uow
            .with_transaction(&(self.albums.clone(),), |(albums,)| async move {
                if let Some(existing) = albums.find_by_name(name).await? {
                    return Err(RepositoryError::AlreadyExists {
                        collection: "albums".to_string(),
                        id: existing.meta.id.to_string(),
                    });
                }
                albums.create(Album::new(created_by, name)).await
            })
            .await?;
        tracing::info!(album_id = %album.meta.id, "album created");
        Ok(album)
    }

    pub async fn find_album_by_name(&self, name: &str) -> Result<Option<Album>> {
        Ok(self.albums.find_by_name(name).await?)
    }
}

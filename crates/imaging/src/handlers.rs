//! Event processors for the image lifecycle.
//!
//! Each event type has exactly one processor, always run through
//! [`BaseEventHandler`] so failures get the same classification, telemetry
//! and dead-letter treatment.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use event_pipeline::{
    BaseEventHandler, BoxError, DomainEvent, ErrorCategory, EventError, EventProcessor,
    EventPublisher, EventRegistry, Message, RetryConfig, RetryingHandler, TelemetrySink,
};
use repository::Repository;

use crate::batch::BatchJobRunner;
use crate::error::ImagingError;
use crate::events::{
    IMAGE_UPLOADED_TOPIC, ImageProcessingCompleted, ImageProcessingRequested, ImageUploaded,
    PROCESSING_COMPLETED_TOPIC, PROCESSING_REQUESTED_TOPIC,
};
use crate::image::{Image, ImageStatus, failure_update, status_update};
use crate::storage::ObjectStorage;

pub const UPLOAD_STATUS_SUBSCRIPTION: &str = "images.uploaded.status";
pub const PROCESSING_REQUESTED_SUBSCRIPTION: &str = "images.processing-requested.worker";
pub const PROCESSING_COMPLETED_SUBSCRIPTION: &str = "images.processing-completed.result";

/// Topic and subscription of every image handler.
pub const SUBSCRIPTIONS: [(&str, &str); 3] = [
    (IMAGE_UPLOADED_TOPIC, UPLOAD_STATUS_SUBSCRIPTION),
    (PROCESSING_REQUESTED_TOPIC, PROCESSING_REQUESTED_SUBSCRIPTION),
    (PROCESSING_COMPLETED_TOPIC, PROCESSING_COMPLETED_SUBSCRIPTION),
];

/// Collaborators shared by the image handlers.
#[derive(Clone)]
pub struct HandlerContext {
    pub images: Repository<Image>,
    pub storage: Arc<dyn ObjectStorage>,
    pub jobs: Arc<dyn BatchJobRunner>,
    pub publisher: EventPublisher,
    pub job_selector: String,
}

fn boxed(e: ImagingError) -> BoxError {
    Box::new(EventError::from(e))
}

/// Confirms an upload landed, marks the image `Uploaded` and asks for
/// processing.
pub struct UploadStatusHandler {
    context: HandlerContext,
}

impl UploadStatusHandler {
    pub fn new(context: HandlerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl EventProcessor<ImageUploaded> for UploadStatusHandler {
    #[tracing::instrument(skip_all, fields(image_id = %event.image_id))]
    async fn process(&self, event: ImageUploaded, _message: &Message) -> Result<(), BoxError> {
        let images = &self.context.images;
        let image = images.read(&event.image_id).await?;
        if image.status != ImageStatus::Uploading {
            tracing::debug!(status = %image.status, "upload already recorded");
            return Ok(());
        }

        let present = self
            .context
            .storage
            .exists(&event.storage_key)
            .await
            .map_err(boxed)?;
        if !present {
            return Err(EventError::retryable(
                format!("object '{}' is not visible yet", event.storage_key),
                ErrorCategory::Transient,
            )
            .with_context("storage_key", event.storage_key)
            .into());
        }

        images
            .update(&event.image_id, &status_update(ImageStatus::Uploaded))
            .await?;
        self.context
            .publisher
            .publish(&ImageProcessingRequested {
                image_id: event.image_id,
            })
            .await
            .map_err(|e| boxed(e.into()))?;
        Ok(())
    }
}

/// Marks an image `Processing` and launches the batch worker for it.
///
/// A request for an image already `Processing` or `Processed` is a duplicate
/// delivery and is acknowledged without launching another job. If the launch
/// fails the image is marked `Failed` with the reason, and the failure is
/// still returned so the request is redelivered.
pub struct ProcessingRequestedHandler {
    context: HandlerContext,
}

impl ProcessingRequestedHandler {
    pub fn new(context: HandlerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl EventProcessor<ImageProcessingRequested> for ProcessingRequestedHandler {
    #[tracing::instrument(skip_all, fields(image_id = %event.image_id))]
    async fn process(
        &self,
        event: ImageProcessingRequested,
        message: &Message,
    ) -> Result<(), BoxError> {
        let images = &self.context.images;
        let image = images.read(&event.image_id).await?;
        match image.status {
            ImageStatus::Uploading => {
                return Err(boxed(ImagingError::InvalidState {
                    expected: "uploaded",
                    actual: image.status,
                }));
            }
            ImageStatus::Processing | ImageStatus::Processed => {
                metrics::counter!("image_processing_jobs_total", "outcome" => "duplicate")
                    .increment(1);
                tracing::debug!(status = %image.status, "processing already started");
                return Ok(());
            }
            ImageStatus::Uploaded | ImageStatus::Failed => {}
        }

        images
            .update(&event.image_id, &status_update(ImageStatus::Processing))
            .await?;

        let env = HashMap::from([
            ("IMAGE_ID".to_string(), event.image_id.to_string()),
            ("STORAGE_KEY".to_string(), image.storage_key.clone()),
            (
                "EVENT_ID".to_string(),
                message.event_id().unwrap_or_default().to_string(),
            ),
        ]);

        match self.context.jobs.trigger(&self.context.job_selector, env).await {
            Ok(execution_id) => {
                metrics::counter!("image_processing_jobs_total", "outcome" => "triggered")
                    .increment(1);
                tracing::info!(execution_id = %execution_id, "processing job triggered");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                metrics::counter!("image_processing_jobs_total", "outcome" => "trigger_failed")
                    .increment(1);
                tracing::warn!(error = %reason, "failed to trigger processing job");
                if let Err(update_err) = images.update(&event.image_id, &failure_update(&reason)).await {
                    tracing::error!(error = %update_err, "failed to record processing failure");
                }
                Err(boxed(e))
            }
        }
    }
}

/// Records the batch worker's outcome on the image.
pub struct ProcessingResultHandler {
    context: HandlerContext,
}

impl ProcessingResultHandler {
    pub fn new(context: HandlerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl EventProcessor<ImageProcessingCompleted> for ProcessingResultHandler {
    #[tracing::instrument(skip_all, fields(image_id = %event.image_id, success = event.success))]
    async fn process(
        &self,
        event: ImageProcessingCompleted,
        _message: &Message,
    ) -> Result<(), BoxError> {
        let updates = if event.success {
            status_update(ImageStatus::Processed).set("variantKeys", event.variant_keys)
        } else {
            failure_update(
                event
                    .error
                    .unwrap_or_else(|| "processing failed".to_string()),
            )
        };
        self.context.images.update(&event.image_id, &updates).await?;
        Ok(())
    }
}

fn base(
    name: &str,
    topic: &str,
    subscription: &str,
    retry: RetryConfig,
    telemetry: &Arc<dyn TelemetrySink>,
) -> BaseEventHandler {
    BaseEventHandler::new(name, topic, subscription, retry, Arc::clone(telemetry))
}

async fn register<E, P>(registry: &EventRegistry, event_type: &str, handler: RetryingHandler<E, P>)
where
    E: DomainEvent,
    P: EventProcessor<E> + 'static,
{
    registry.register(event_type, Arc::new(handler)).await;
}

/// Registers the three image handlers.
pub async fn register_handlers(
    registry: &EventRegistry,
    context: HandlerContext,
    retry: RetryConfig,
    telemetry: Arc<dyn TelemetrySink>,
) {
    register(
        registry,
        "ImageUploaded",
        RetryingHandler::<ImageUploaded, _>::new(
            base("upload-status", IMAGE_UPLOADED_TOPIC, UPLOAD_STATUS_SUBSCRIPTION, retry, &telemetry),
            Arc::new(UploadStatusHandler::new(context.clone())),
        ),
    )
    .await;
    register(
        registry,
        "ImageProcessingRequested",
        RetryingHandler::<ImageProcessingRequested, _>::new(
            base(
                "processing-requested",
                PROCESSING_REQUESTED_TOPIC,
                PROCESSING_REQUESTED_SUBSCRIPTION,
                retry,
                &telemetry,
            ),
            Arc::new(ProcessingRequestedHandler::new(context.clone())),
        ),
    )
    .await;
    register(
        registry,
        "ImageProcessingCompleted",
        RetryingHandler::<ImageProcessingCompleted, _>::new(
            base(
                "processing-result",
                PROCESSING_COMPLETED_TOPIC,
                PROCESSING_COMPLETED_SUBSCRIPTION,
                retry,
                &telemetry,
            ),
            Arc::new(ProcessingResultHandler::new(context)),
        ),
    )
    .await;
}

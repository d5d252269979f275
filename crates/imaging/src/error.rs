//! Imaging error types.

use event_pipeline::{ErrorCategory, EventError, PipelineError, Severity};
use repository::RepositoryError;
use thiserror::Error;

use crate::image::ImageStatus;

/// Errors that can occur in the imaging domain.
#[derive(Debug, Error)]
pub enum ImagingError {
    /// Persistence failed.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Publishing an event failed.
    #[error("Event pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Object storage error.
    #[error("Object storage error: {0}")]
    Storage(String),

    /// Batch job runner error.
    #[error("Batch job error: {0}")]
    BatchJob(String),

    /// The image is in the wrong state for the requested operation.
    #[error("Invalid image state: expected {expected}, actual {actual}")]
    InvalidState {
        expected: &'static str,
        actual: ImageStatus,
    },
}

/// Convenience type alias for imaging results.
pub type Result<T> = std::result::Result<T, ImagingError>;

impl From<ImagingError> for EventError {
    fn from(e: ImagingError) -> Self {
        match e {
            ImagingError::Repository(repo) => EventError::from(repo),
            ImagingError::Pipeline(PipelineError::Event(event)) => event,
            ImagingError::InvalidState { .. } => {
                EventError::non_retryable(e, ErrorCategory::Validation).with_severity(Severity::Low)
            }
            ImagingError::Pipeline(_) | ImagingError::Storage(_) | ImagingError::BatchJob(_) => {
                EventError::retryable(e, ErrorCategory::External)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collaborator_failures_are_retryable() {
        let err = EventError::from(ImagingError::BatchJob("quota exceeded".into()));
        assert!(err.retryable);
        assert_eq!(err.category, ErrorCategory::External);
    }

    #[test]
    fn repository_failures_keep_their_classification() {
        let err = EventError::from(ImagingError::Repository(RepositoryError::NotFound {
            collection: "images".into(),
            id: "img-1".into(),
        }));
        assert!(!err.retryable);
        assert_eq!(err.category, ErrorCategory::NotFound);
    }

    #[test]
    fn invalid_state_is_not_retried() {
        let err = EventError::from(ImagingError::InvalidState {
            expected: "uploaded",
            actual: ImageStatus::Uploading,
        });
        assert!(!err.retryable);
    }
}

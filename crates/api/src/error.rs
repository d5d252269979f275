//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use event_pipeline::PipelineError;
use imaging::ImagingError;
use repository::RepositoryError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Missing or wrong `x-api-key`.
    Unauthorized(String),
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// The request conflicts with current state.
    Conflict(String),
    /// Internal server error.
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                msg
            }
            ApiError::Unauthorized(msg)
            | ApiError::NotFound(msg)
            | ApiError::BadRequest(msg)
            | ApiError::Conflict(msg) => msg,
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        let message = err.to_string();
        match err {
            RepositoryError::NotFound { .. } => ApiError::NotFound(message),
            RepositoryError::AlreadyExists { .. }
            | RepositoryError::Conflict(_)
            | RepositoryError::TransactionAborted(_) => ApiError::Conflict(message),
            RepositoryError::Validation { .. }
            | RepositoryError::InvalidInput(_)
            | RepositoryError::TooManyOperations { .. } => ApiError::BadRequest(message),
            RepositoryError::Internal(_) => ApiError::Internal(message),
        }
    }
}

impl From<ImagingError> for ApiError {
    fn from(err: ImagingError) -> Self {
        match err {
            ImagingError::Repository(e) => e.into(),
            invalid @ ImagingError::InvalidState { .. } => ApiError::Conflict(invalid.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use imaging::ImageStatus;

    use super::*;

    #[test]
    fn repository_errors_map_to_status_codes() {
        let cases = [
            (
                RepositoryError::NotFound {
                    collection: "images".into(),
                    id: "x".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                RepositoryError::AlreadyExists {
                    collection: "albums".into(),
                    id: "x".into(),
                },
                StatusCode::CONFLICT,
            ),
            (RepositoryError::Conflict("stale".into()), StatusCode::CONFLICT),
            (
                RepositoryError::TransactionAborted("race".into()),
                StatusCode::CONFLICT,
            ),
            (
                RepositoryError::validation("sizeBytes", "expected integer"),
                StatusCode::BAD_REQUEST,
            ),
            (RepositoryError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (
                RepositoryError::TooManyOperations {
                    requested: 600,
                    limit: 500,
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                RepositoryError::Internal("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    #[test]
    fn imaging_errors_map_to_status_codes() {
        let invalid = ImagingError::InvalidState {
            expected: "uploaded",
            actual: ImageStatus::Uploading,
        };
        assert_eq!(ApiError::from(invalid).status(), StatusCode::CONFLICT);

        let storage = ImagingError::Storage("unreachable".into());
        assert_eq!(
            ApiError::from(storage).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

use thiserror::Error;

/// Errors that can occur when interacting with a document store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The document does not exist.
    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// A document with this ID already exists.
    #[error("Document already exists: {collection}/{id}")]
    AlreadyExists { collection: String, id: String },

    /// The transaction was aborted because of a concurrent write.
    #[error("Transaction aborted: {0}")]
    Aborted(String),

    /// The operation cannot run in the store's current state
    /// (for example a query that needs a composite index that does not exist).
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// The request itself is malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The transaction has already been committed or rolled back.
    #[error("Transaction is no longer active")]
    TransactionClosed,

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns a short, stable status code for the error, in the style of
    /// RPC status codes.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::AlreadyExists { .. } => "ALREADY_EXISTS",
            StoreError::Aborted(_) => "ABORTED",
            StoreError::FailedPrecondition(_) => "FAILED_PRECONDITION",
            StoreError::InvalidArgument(_) => "INVALID_ARGUMENT",
            StoreError::TransactionClosed => "FAILED_PRECONDITION",
            StoreError::Database(_) | StoreError::Migration(_) | StoreError::Serialization(_) => {
                "INTERNAL"
            }
        }
    }
}

/// Result type for document store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = StoreError::FailedPrecondition("The query requires an index".into());
        assert_eq!(err.code(), "FAILED_PRECONDITION");
        assert_eq!(StoreError::Aborted("conflict".into()).code(), "ABORTED");
        assert_eq!(
            StoreError::NotFound {
                collection: "images".into(),
                id: "x".into()
            }
            .code(),
            "NOT_FOUND"
        );
    }
}

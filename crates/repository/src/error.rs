//! Repository error taxonomy.

use document_store::StoreError;
use thiserror::Error;

/// Errors returned by repositories and the unit of work.
///
/// Store errors are translated into this taxonomy at the repository boundary;
/// callers never see backend error types.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The entity does not exist.
    #[error("{collection} not found: {id}")]
    NotFound { collection: String, id: String },

    /// An entity with this ID already exists.
    #[error("{collection} already exists: {id}")]
    AlreadyExists { collection: String, id: String },

    /// The transaction lost a race with a concurrent writer.
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    /// The operation conflicts with the current state of the store.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A field value failed type validation.
    #[error("Validation failed for field '{field}': {message}")]
    Validation { field: String, message: String },

    /// The request is malformed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A transactional batch would exceed the per-transaction write ceiling.
    #[error("Too many operations: {requested} requested, at most {limit} allowed in one transaction")]
    TooManyOperations { requested: usize, limit: usize },

    /// Any other failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RepositoryError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        RepositoryError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<StoreError> for RepositoryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { collection, id } => RepositoryError::NotFound { collection, id },
            StoreError::AlreadyExists { collection, id } => {
                RepositoryError::AlreadyExists { collection, id }
            }
            StoreError::Aborted(msg) => RepositoryError::TransactionAborted(msg),
            StoreError::FailedPrecondition(msg) => RepositoryError::Conflict(msg),
            StoreError::InvalidArgument(msg) => RepositoryError::InvalidInput(msg),
            StoreError::TransactionClosed => {
                RepositoryError::InvalidInput("transaction is no longer active".to_string())
            }
            e @ (StoreError::Database(_)
            | StoreError::Migration(_)
            | StoreError::Serialization(_)) => RepositoryError::Internal(e.to_string()),
        }
    }
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

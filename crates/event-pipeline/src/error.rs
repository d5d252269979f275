//! Pipeline error types and failure classification.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::HashMap;

use repository::RepositoryError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Boxed error returned by event processing functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What kind of failure an [`EventError`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Conflict,
    Transient,
    External,
    Serialization,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Transient => "transient",
            ErrorCategory::External => "external",
            ErrorCategory::Serialization => "serialization",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How urgently a failure needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A processing failure classified along two independent axes: whether
/// retrying can help, and how severe it is.
#[derive(Debug, Error)]
#[error("{category} error ({severity}): {source}")]
pub struct EventError {
    source: BoxError,
    pub retryable: bool,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub context: HashMap<String, Value>,
    pub stack_trace: Option<String>,
}

impl EventError {
    pub fn new(
        source: impl Into<BoxError>,
        retryable: bool,
        category: ErrorCategory,
        severity: Severity,
    ) -> Self {
        Self {
            source: source.into(),
            retryable,
            category,
            severity,
            context: HashMap::new(),
            stack_trace: None,
        }
    }

    /// A failure that may succeed on redelivery.
    pub fn retryable(source: impl Into<BoxError>, category: ErrorCategory) -> Self {
        Self::new(source, true, category, Severity::Medium)
    }

    /// A failure that will fail the same way on every redelivery.
    pub fn non_retryable(source: impl Into<BoxError>, category: ErrorCategory) -> Self {
        Self::new(source, false, category, Severity::Medium)
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Records the cause chain, one cause per line, followed by a backtrace
    /// when `RUST_BACKTRACE` enables one.
    pub fn with_stack_trace(mut self) -> Self {
        let mut causes = Vec::new();
        let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(self.inner());
        while let Some(error) = cause {
            causes.push(error.to_string());
            cause = error.source();
        }

        let mut trace = causes.join("\ncaused by: ");
        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            trace.push_str("\n\n");
            trace.push_str(&backtrace.to_string());
        }
        self.stack_trace = Some(trace);
        self
    }

    /// The underlying cause.
    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.source.as_ref()
    }

    /// Keeps an already classified error; anything else becomes a
    /// retryable, high-severity internal error so it is retried rather than
    /// dropped. Unclassified errors carry their cause chain as the stack trace.
    pub fn classify(error: BoxError) -> Self {
        match error.downcast::<EventError>() {
            Ok(classified) => *classified,
            Err(other) => match other.downcast::<RepositoryError>() {
                Ok(repo) => EventError::from(*repo),
                Err(other) => {
                    EventError::new(other, true, ErrorCategory::Internal, Severity::High)
                        .with_stack_trace()
                }
            },
        }
    }
}

impl From<RepositoryError> for EventError {
    fn from(e: RepositoryError) -> Self {
        let (retryable, category, severity) = match &e {
            RepositoryError::NotFound { .. } => (false, ErrorCategory::NotFound, Severity::Medium),
            RepositoryError::AlreadyExists { .. } => (false, ErrorCategory::Conflict, Severity::Low),
            RepositoryError::TransactionAborted(_) | RepositoryError::Conflict(_) => {
                (true, ErrorCategory::Conflict, Severity::Medium)
            }
            RepositoryError::Validation { .. }
            | RepositoryError::InvalidInput(_)
            | RepositoryError::TooManyOperations { .. } => {
                (false, ErrorCategory::Validation, Severity::Medium)
            }
            RepositoryError::Internal(_) => (true, ErrorCategory::Internal, Severity::High),
        };
        EventError::new(e, retryable, category, severity)
    }
}

/// Errors raised by the pipeline itself.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No handler is registered for the message's event type.
    #[error("No handler registered for event type '{0}'")]
    NoHandler(String),

    /// A required message attribute is absent.
    #[error("Message is missing the '{0}' attribute")]
    MissingAttribute(&'static str),

    /// No topic is configured for an event type.
    #[error("No topic configured for event type '{0}'")]
    UnknownTopic(String),

    /// Failed to encode or decode an event.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The broker rejected an operation.
    #[error("Broker error: {0}")]
    Broker(String),

    /// A telemetry or dead-letter write failed.
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// Processing failed with a classified error.
    #[error(transparent)]
    Event(#[from] EventError),

    /// The pipeline configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

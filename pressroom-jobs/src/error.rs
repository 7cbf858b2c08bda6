//! Error types for queue operations and job handlers.

use http::StatusCode;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-specific errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No job with this ID in any set of any queue
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Operation not valid for the job's current status
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation collides with an in-flight job
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Transient infrastructure failure
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Domain error surfaced by a job handler. Workers record it on the job
    /// and never return it to producers.
    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    /// No handler registered for the job type
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// An operation or a handler ran past its time budget
    #[error("Operation timeout")]
    Timeout,

    /// Worker pool already running
    #[error("Worker pool already running")]
    WorkerAlreadyRunning,

    /// Worker pool not running
    #[error("Worker pool not running")]
    WorkerNotRunning,
}

impl QueueError {
    /// HTTP status an admin layer should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState(_) | Self::Conflict(_) => StatusCode::BAD_REQUEST,
            Self::StoreUnavailable(_) | Self::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Timeout)
    }

    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::Conflict(_) => "conflict",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::HandlerFailure(_) => "handler_failure",
            Self::UnknownJobType(_) => "unknown_job_type",
            Self::Serialization(_) | Self::Deserialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::Timeout => "timeout",
            Self::WorkerAlreadyRunning | Self::WorkerNotRunning => "worker_state",
        }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

/// Result type returned by job handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Failure reported by a job handler.
///
/// Retryable failures count against the job's attempt budget; fatal ones send
/// the job straight to `failed`.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Try again after a backoff
    #[error("{0}")]
    Retryable(String),

    /// Retrying cannot help
    #[error("{0}")]
    Fatal(String),
}

impl HandlerError {
    /// Create a retryable failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    /// Create a fatal failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Check if the failure bypasses the retry budget.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Failure reason recorded on the job.
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Fatal(msg) => msg,
        }
    }
}

impl From<HandlerError> for QueueError {
    fn from(err: HandlerError) -> Self {
        Self::HandlerFailure(err.message().to_string())
    }
}

impl From<QueueError> for HandlerError {
    fn from(err: QueueError) -> Self {
        Self::Retryable(err.to_string())
    }
}

// A payload that does not decode will not decode on the next attempt either.
impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Fatal(format!("invalid payload: {}", err))
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::Retryable(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::Retryable(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            QueueError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            QueueError::InvalidState("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            QueueError::Conflict("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            QueueError::StoreUnavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            QueueError::Config("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(QueueError::StoreUnavailable("down".into()).is_retryable());
        assert!(QueueError::Timeout.is_retryable());
        assert!(!QueueError::Conflict("busy".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = QueueError::NotFound("job123".to_string());
        assert!(err.to_string().contains("job123"));
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_handler_error_conversions() {
        let from_str: HandlerError = "upstream 502".into();
        assert!(!from_str.is_fatal());
        assert_eq!(from_str.message(), "upstream 502");

        let bad_json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let from_json: HandlerError = bad_json.into();
        assert!(from_json.is_fatal());
        assert!(from_json.message().starts_with("invalid payload"));

        let from_queue: HandlerError = QueueError::Timeout.into();
        assert!(!from_queue.is_fatal());
    }

    #[test]
    fn test_handler_failure_keeps_message() {
        let err = QueueError::from(HandlerError::fatal("malformed feed"));
        assert!(matches!(&err, QueueError::HandlerFailure(msg) if msg == "malformed feed"));
        assert_eq!(err.code(), "handler_failure");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(QueueError::Timeout.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(QueueError::UnknownJobType("general/x".into()).code(), "unknown_job_type");
    }
}

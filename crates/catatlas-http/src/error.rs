//! Error taxonomy shared by every layer of the request pipeline
//!
//! Failures are normalized into an [`ApiError`] at the boundary where they
//! occur (transport or status code). Retry and circuit breaker layers only
//! pass these through or re-tag them.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, HttpError>;

/// Opaque underlying cause attached to a classified error
pub type ErrorCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Classified category of a failure, independent of its message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The server could not be reached
    NetworkError,
    /// An attempt exceeded its time bound
    TimeoutError,
    /// HTTP 400
    BadRequest,
    /// HTTP 401
    Unauthorized,
    /// HTTP 403
    Forbidden,
    /// HTTP 404
    NotFound,
    /// HTTP 5xx
    ServerError,
    /// Caller-side input problem, raised before any request is made
    ValidationError,
    /// The circuit breaker rejected the call without invoking it
    CircuitBreakerOpen,
    /// Every allowed attempt failed
    MaxRetriesExceeded,
    /// The caller cancelled the request
    Cancelled,
    /// Anything not covered above
    #[serde(rename = "UNKNOWN_ERROR")]
    Unknown,
}

impl ErrorKind {
    /// Stable wire code for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::TimeoutError => "TIMEOUT_ERROR",
            ErrorKind::BadRequest => "BAD_REQUEST",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            ErrorKind::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// Text suitable for showing to an end user
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::NetworkError => {
                "Unable to connect to the server. Please check your internet connection."
            }
            ErrorKind::TimeoutError => "The request took too long. Please try again.",
            ErrorKind::BadRequest => "Invalid request. Please check your input.",
            ErrorKind::Unauthorized => "Please log in to continue.",
            ErrorKind::Forbidden => "You don't have permission to perform this action.",
            ErrorKind::NotFound => "The requested resource was not found.",
            ErrorKind::ServerError => "Server error. Please try again later.",
            ErrorKind::ValidationError => "Please check your input and try again.",
            ErrorKind::CircuitBreakerOpen => {
                "Service is temporarily unavailable. Please try again in a moment."
            }
            ErrorKind::MaxRetriesExceeded => {
                "Request failed after multiple attempts. Please try again later."
            }
            ErrorKind::Cancelled => "The request was cancelled.",
            ErrorKind::Unknown => "An unexpected error occurred. Please try again.",
        }
    }

    /// Retryability of a kind when nothing more specific is known
    fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkError | ErrorKind::TimeoutError | ErrorKind::ServerError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure
///
/// Built once at the failure boundary and never mutated afterwards; re-tagging
/// (for example on retry exhaustion) produces a new value.
#[derive(Clone)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    status_code: Option<u16>,
    endpoint: Option<String>,
    timestamp: DateTime<Utc>,
    retryable: bool,
    retry_after_seconds: Option<u64>,
    cause: Option<ErrorCause>,
}

impl ApiError {
    /// Create an error of the given kind with the kind's default retryability
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            endpoint: None,
            timestamp: Utc::now(),
            retryable: kind.default_retryable(),
            retry_after_seconds: None,
            cause: None,
        }
    }

    /// Caller-side input problem; never retried
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    /// Request aborted by the caller's cancellation token
    pub fn cancelled(endpoint: Option<&str>) -> Self {
        let error = Self::new(ErrorKind::Cancelled, "Request was cancelled");
        match endpoint {
            Some(endpoint) => error.with_endpoint(endpoint),
            None => error,
        }
    }

    /// Set the HTTP status code
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Set the endpoint the failure belongs to
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Override retryability
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Set the server-provided retry hint
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }

    /// Attach the underlying cause
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Re-tag as [`ErrorKind::MaxRetriesExceeded`], keeping every other field
    pub fn exhausted(self, attempts: u32) -> Self {
        Self {
            kind: ErrorKind::MaxRetriesExceeded,
            message: format!("{} (after {} attempts)", self.message, attempts),
            ..self
        }
    }

    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the HTTP status code, if a response was received
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// Get the endpoint the failure belongs to
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Get the time the error was created
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Check if the failure is worth retrying
    pub fn retryable(&self) -> bool {
        self.retryable
    }

    /// Get the retry hint in seconds
    pub fn retry_after_seconds(&self) -> Option<u64> {
        self.retry_after_seconds
    }

    /// Get the underlying cause
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// Text suitable for showing to an end user
    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }
}

impl fmt::Debug for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("status_code", &self.status_code)
            .field("endpoint", &self.endpoint)
            .field("timestamp", &self.timestamp)
            .field("retryable", &self.retryable)
            .field("retry_after_seconds", &self.retry_after_seconds)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Pipeline errors
///
/// Only [`HttpError::Api`] is eligible for retry. The other variants are
/// programming or setup errors and propagate unchanged.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Classified request failure
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Request body or response body could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid client configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Client build error
    #[error("Failed to build HTTP client: {0}")]
    BuildError(String),
}

impl HttpError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Api(e) => e.retryable(),
            _ => false,
        }
    }

    /// The classified error, if this is one
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            HttpError::Api(e) => Some(e),
            _ => None,
        }
    }

    /// Kind of the classified error, if this is one
    pub fn kind(&self) -> Option<ErrorKind> {
        self.api_error().map(ApiError::kind)
    }

    /// Normalize into exactly one [`ApiError`] for the final consumer
    pub fn into_api_error(self, endpoint: &str) -> ApiError {
        crate::classifier::from_error(self, endpoint)
    }
}

impl From<config::ConfigError> for HttpError {
    fn from(err: config::ConfigError) -> Self {
        HttpError::Config(err.to_string())
    }
}

use thiserror::Error;

use crate::models::{HeaderMap, RequestDescriptor};

/// Application-wide error types for trawl.
///
/// Every variant is `Clone`: a fetch collapsed onto an in-flight request
/// hands the same settled result to each waiting caller.
#[derive(Error, Debug, Clone)]
pub enum AppError {
    /// HTTP request could not be built or sent.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Response status is outside the caller's accepted set.
    #[error("{0}")]
    HttpValidation(Box<ValidationFailure>),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// A sandboxed scraper tried to exceed its capability grant.
    #[error("Permission denied: {message}")]
    InvalidPermissions {
        message: String,
        stacktrace: Option<String>,
    },

    /// Unexpected or malformed message on the controller/sandbox channel.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The rate limit queue was closed with unfinished tasks.
    #[error("Queue closed with {pending} unfinished task(s)")]
    QueueShutdown { pending: usize },

    /// Two distinct sources claim the same scraper name.
    #[error(
        "Duplicate scraper name '{name}'. Names must be unique; \
         it is already claimed by {existing_source}"
    )]
    DuplicateRegistration {
        name: String,
        existing_source: String,
    },

    /// No registered entrypoint pattern matches the input.
    #[error("No entrypoint of '{scraper}' matches input '{input}'")]
    NoMatchingEntrypoint { scraper: String, input: String },

    /// Invalid configuration or option combination.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Cache store operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Filesystem operation failed.
    #[error("IO error: {0}")]
    IoError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Scraper code failed for any other reason.
    #[error("{0}")]
    Generic(String),
}

/// Diagnostics carried by [`AppError::HttpValidation`].
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub request: RequestDescriptor,
    pub status: u16,
    pub response_headers: HeaderMap,
    pub expected: String,
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HTTP {} {} returned status {} (expected {})",
            self.request.method, self.request.url, self.status, self.expected
        )
    }
}

impl AppError {
    /// Build a permission error without a stack trace.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        AppError::InvalidPermissions {
            message: message.into(),
            stacktrace: None,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            AppError::HttpValidation(failure) => {
                failure.status == 429 || (500..600).contains(&failure.status)
            }
            _ => false,
        }
    }

    /// Returns true if a sandbox tried to exceed its capability grant.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, AppError::InvalidPermissions { .. })
    }

    /// The response status carried by a validation failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            AppError::HttpValidation(failure) => Some(failure.status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::SerializationError(e.to_string())
    }
}

/// OS-level `PermissionDenied` stays an `IoError`: only the sandbox's own
/// checks raise `InvalidPermissions`.
impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::IoError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(status: u16) -> AppError {
        AppError::HttpValidation(Box::new(ValidationFailure {
            request: RequestDescriptor::get("https://example.com"),
            status,
            response_headers: HeaderMap::new(),
            expected: "2xx".into(),
        }))
    }

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(failure(503).is_retryable());
        assert!(failure(429).is_retryable());
        assert!(!failure(404).is_retryable());
        assert!(!AppError::permission_denied("net").is_retryable());
        assert!(!AppError::ProtocolViolation("bad".into()).is_retryable());
    }

    #[test]
    fn test_validation_message_names_request_and_status() {
        let msg = failure(404).to_string();
        assert!(msg.contains("GET https://example.com"));
        assert!(msg.contains("404"));
        assert_eq!(failure(404).status(), Some(404));
    }

    #[test]
    fn test_os_permission_errors_are_io_errors() {
        let err: AppError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only folder").into();
        assert!(matches!(err, AppError::IoError(_)));
        assert!(!err.is_permission_denied());
        let err: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, AppError::IoError(_)));
    }
}

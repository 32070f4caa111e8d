//! Error types and result aliases for the Skalds platform.
//!
//! Errors are structured for programmatic handling: adapters distinguish
//! "missing" (an `Ok(None)`) from real failures, and transient I/O is
//! represented so callers can decide to skip a cycle rather than abort.

use std::fmt;

/// The result type used throughout Skalds.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core Skalds operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A validation rule was violated.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the violated rule.
        message: String,
    },

    /// The requested resource was not found.
    #[error("not found: {resource_type} with id {id}")]
    ResourceNotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A resource with the same identifier already exists.
    #[error("already exists: {resource_type} with id {id}")]
    AlreadyExists {
        /// The type of resource that collided.
        resource_type: &'static str,
        /// The identifier that collided.
        id: String,
    },

    /// A cache operation failed (transient; callers may retry or skip).
    #[error("cache error: {message}")]
    Cache {
        /// Description of the cache failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An operation exceeded its deadline.
    #[error("deadline exceeded: {operation}")]
    DeadlineExceeded {
        /// The operation that timed out.
        operation: &'static str,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new cache error with the given message.
    #[must_use]
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new cache error with a source cause.
    #[must_use]
    pub fn cache_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Cache {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new resource not found error.
    #[must_use]
    pub fn resource_not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::ResourceNotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new already-exists error.
    #[must_use]
    pub fn already_exists(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::AlreadyExists {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Returns true if the error is transient and the operation may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Cache { .. } | Self::DeadlineExceeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_error_is_transient() {
        assert!(Error::cache("connection reset").is_transient());
        assert!(
            Error::DeadlineExceeded {
                operation: "get_string"
            }
            .is_transient()
        );
        assert!(!Error::validation("bad priority").is_transient());
    }

    #[test]
    fn not_found_display_includes_id() {
        let err = Error::resource_not_found("task", "t-42");
        assert!(err.to_string().contains("task"));
        assert!(err.to_string().contains("t-42"));
    }

    #[test]
    fn cache_error_preserves_source() {
        use std::error::Error as StdError;
        let source = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = Error::cache_with_source("redis unreachable", source);
        assert!(StdError::source(&err).is_some());
    }
}

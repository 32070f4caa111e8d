//! Error types for the controller domain.

use skalds_core::TaskId;

/// The result type used throughout skalds-controller.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in controller operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A task was not found in the repository.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: TaskId,
    },

    /// An invalid lifecycle transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current status.
        from: String,
        /// The attempted target status.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A repository operation failed (transient; the cycle is skipped).
    #[error("repository error: {message}")]
    Repository {
        /// Description of the repository failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An event publish or subscribe failed.
    #[error("event bus error: {message}")]
    Event {
        /// Description of the event bus failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from skalds-core.
    #[error("core error: {0}")]
    Core(#[from] skalds_core::Error),
}

impl Error {
    /// Creates a new repository error.
    #[must_use]
    pub fn repository(message: impl Into<String>) -> Self {
        Self::Repository {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new repository error with a source.
    #[must_use]
    pub fn repository_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Repository {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new event bus error.
    #[must_use]
    pub fn event(message: impl Into<String>) -> Self {
        Self::Event {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new event bus error with a source.
    #[must_use]
    pub fn event_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Event {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true if the error is transient and the cycle may be skipped.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Repository { .. } | Self::Event { .. } => true,
            Self::Core(core) => core.is_transient(),
            _ => false,
        }
    }
}

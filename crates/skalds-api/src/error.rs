//! API error types and HTTP response mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use skalds_controller::error::Error as ControllerError;
use skalds_core::Error as CoreError;

/// API result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// Standard JSON error envelope.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    /// Short human-readable description.
    pub error: String,
    /// Optional longer detail (redacted for internal failures).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Stable machine-readable code.
    pub code: String,
    /// Epoch millis, as a string.
    pub timestamp: String,
}

/// HTTP API error with a stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    error: String,
    detail: Option<String>,
}

impl ApiError {
    /// Returns a 400 for invalid input.
    pub fn validation(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_ERROR",
            error: "invalid request".to_string(),
            detail: Some(detail.into()),
        }
    }

    /// Returns a 400 for a lifecycle transition the state machine forbids.
    pub fn invalid_status(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_STATUS",
            error: "invalid status transition".to_string(),
            detail: Some(detail.into()),
        }
    }

    /// Returns a 404 for a missing task.
    pub fn task_not_found(id: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "TASK_NOT_FOUND",
            error: format!("task not found: {id}"),
            detail: None,
        }
    }

    /// Returns a 404 for a missing skald.
    pub fn skald_not_found(id: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "SKALD_NOT_FOUND",
            error: format!("skald not found: {id}"),
            detail: None,
        }
    }

    /// Returns a 503 when an external collaborator is unreachable.
    pub fn service_unavailable(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "SERVICE_UNAVAILABLE",
            error: "a backing service is unreachable".to_string(),
            detail: Some(detail.into()),
        }
    }

    /// Returns a 500 with the detail redacted.
    pub fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL",
            error: "internal error".to_string(),
            detail: None,
        }
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.error,
            detail: self.detail,
            code: self.code.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis().to_string(),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ControllerError> for ApiError {
    fn from(value: ControllerError) -> Self {
        match value {
            ControllerError::TaskNotFound { task_id } => Self::task_not_found(task_id),
            ControllerError::InvalidStateTransition { from, to, reason } => {
                Self::invalid_status(format!("{from} -> {to}: {reason}"))
            }
            ControllerError::Repository { message, .. } | ControllerError::Event { message, .. } => {
                Self::service_unavailable(message)
            }
            ControllerError::Configuration { message } => Self::validation(message),
            ControllerError::Serialization { .. } => Self::internal(),
            ControllerError::Core(core) => core.into(),
        }
    }
}

/// Errors from running the HTTP server itself (bind and serve), as
/// opposed to per-request failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configured host/port pair is not a valid socket address.
    #[error("invalid bind address {addr}: {message}")]
    InvalidBindAddress {
        /// The address that failed to parse.
        addr: String,
        /// Description of the parse failure.
        message: String,
    },

    /// The listener could not bind; fatal at startup.
    #[error("failed to bind {addr}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The server failed while running.
    #[error("server error")]
    Serve {
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

impl From<CoreError> for ApiError {
    fn from(value: CoreError) -> Self {
        match value {
            CoreError::InvalidInput(message) | CoreError::Validation { message } => {
                Self::validation(message)
            }
            CoreError::ResourceNotFound { resource_type, id } => {
                if resource_type == "skald" {
                    Self::skald_not_found(id)
                } else {
                    Self::task_not_found(id)
                }
            }
            CoreError::AlreadyExists { resource_type, id } => {
                Self::validation(format!("{resource_type} already exists: {id}"))
            }
            CoreError::Cache { message, .. } => Self::service_unavailable(message),
            CoreError::DeadlineExceeded { operation } => {
                Self::service_unavailable(format!("{operation} timed out"))
            }
            CoreError::Serialization { .. } | CoreError::Internal { .. } => Self::internal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_line_up() {
        assert_eq!(ApiError::validation("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(
            ApiError::invalid_status("x").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::invalid_status("x").code(), "INVALID_STATUS");
        assert_eq!(
            ApiError::task_not_found("t1").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::skald_not_found("s1").code(),
            "SKALD_NOT_FOUND"
        );
        assert_eq!(
            ApiError::service_unavailable("x").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::internal().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_error_has_no_detail() {
        let response = ApiError::internal().into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn server_error_display_names_the_address() {
        let err = ServerError::Bind {
            addr: "0.0.0.0:8080".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("0.0.0.0:8080"));

        let err = ServerError::InvalidBindAddress {
            addr: "nowhere:?".to_string(),
            message: "bad port".to_string(),
        };
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn controller_errors_map_to_stable_codes() {
        let err: ApiError = ControllerError::repository("mongo down").into();
        assert_eq!(err.code(), "SERVICE_UNAVAILABLE");

        let err: ApiError = ControllerError::InvalidStateTransition {
            from: "Finished".into(),
            to: "Created".into(),
            reason: "terminal".into(),
        }
        .into();
        assert_eq!(err.code(), "INVALID_STATUS");

        let err: ApiError = CoreError::resource_not_found("skald", "s9").into();
        assert_eq!(err.code(), "SKALD_NOT_FOUND");
    }
}

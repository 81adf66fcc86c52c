//! # Error Handling
//!
//! Two error families live here:
//!
//! - [`PipelineError`]: failures inside the audio/session pipeline. These never
//!   escape the call controller as panics; they are folded into the single
//!   user-visible status/error pair.
//! - [`AppError`]: failures at the HTTP boundary, rendered as JSON through
//!   actix's [`ResponseError`].
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "call_active",
//!     "message": "a call is already active",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Failures raised while running a call.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// The remote session could not be opened or a send failed.
    Connection(String),

    /// Input or output device unavailable, denied or failed to build a stream.
    Device(String),

    /// Inbound audio bytes could not be decoded. The chunk is dropped.
    MalformedPayload(String),

    /// One teardown step failed; the remaining steps still ran.
    Teardown { step: &'static str, message: String },

    /// `start` was requested while a call is already in progress.
    CallActive,

    /// A pending start was superseded by `stop`.
    Cancelled,

    /// The call controller is gone (shutdown or crashed thread).
    ControllerUnavailable,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Connection(msg) => write!(f, "Connection failed: {}", msg),
            PipelineError::Device(msg) => write!(f, "Audio device error: {}", msg),
            PipelineError::MalformedPayload(msg) => write!(f, "Malformed audio payload: {}", msg),
            PipelineError::Teardown { step, message } => {
                write!(f, "Teardown step '{}' failed: {}", step, message)
            }
            PipelineError::CallActive => write!(f, "A call is already active"),
            PipelineError::Cancelled => write!(f, "Call start was cancelled"),
            PipelineError::ControllerUnavailable => write!(f, "Call controller is not running"),
        }
    }
}

impl std::error::Error for PipelineError {}

/// HTTP-facing error types.
///
/// ## Error Categories:
/// - **Internal** / **ConfigError**: 500
/// - **BadRequest** / **ValidationError**: 400
/// - **NotFound**: 404
/// - **Conflict**: 409 (call already active)
/// - **Unavailable**: 503 (devices or remote engine unreachable)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    Conflict(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl AppError {
    fn parts(&self) -> (actix_web::http::StatusCode, &'static str, &str) {
        use actix_web::http::StatusCode;

        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "call_active", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always caused by the client, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::CallActive => AppError::Conflict(err.to_string()),
            PipelineError::Device(_)
            | PipelineError::Connection(_)
            | PipelineError::ControllerUnavailable => AppError::Unavailable(err.to_string()),
            PipelineError::Cancelled => AppError::Conflict(err.to_string()),
            PipelineError::MalformedPayload(_) | PipelineError::Teardown { .. } => {
                AppError::Internal(err.to_string())
            }
        }
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_pipeline_error_status_mapping() {
        let conflict: AppError = PipelineError::CallActive.into();
        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);

        let device: AppError = PipelineError::Device("permission denied".into()).into();
        assert_eq!(device.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(device.to_string().contains("permission denied"));

        let teardown: AppError = PipelineError::Teardown {
            step: "close_session",
            message: "socket gone".into(),
        }
        .into();
        assert_eq!(teardown.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_json_error_is_bad_request() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let app: AppError = err.into();
        assert_eq!(app.status_code(), StatusCode::BAD_REQUEST);
    }
}

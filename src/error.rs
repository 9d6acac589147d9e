//! # Error Handling
//!
//! HTTP-facing error type and its conversion into JSON responses.
//!
//! The core components report failures through their own `thiserror` enums
//! (`ResolveError`, `WarmupError`, `TranscribeError`); handlers convert those
//! into [`AppError`] with `?`, and actix renders them through
//! [`ResponseError`].
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "detail": "model is loading, please retry shortly",
//!   "error": {
//!     "type": "service_unavailable",
//!     "message": "model is loading, please retry shortly",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```
//! `detail` carries the plain message for clients that only look at one field.

use crate::transcription::TranscribeError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems, including inference failures (500)
/// - **BadRequest**: Malformed upload or missing file (400)
/// - **ValidationError**: Input failed validation rules (400)
/// - **ServiceUnavailable**: Model still loading or failed to load (503)
/// - **PayloadTooLarge**: Upload above the configured limit (413)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    ValidationError(String),
    ServiceUnavailable(String),
    PayloadTooLarge(String),
}

impl AppError {
    /// Message without the category prefix.
    pub fn detail(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::ValidationError(msg)
            | AppError::ServiceUnavailable(msg)
            | AppError::PayloadTooLarge(msg) => msg,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::ValidationError(_) => "validation_error",
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::PayloadTooLarge(_) => "payload_too_large",
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "detail": self.detail(),
            "error": {
                "type": self.error_type(),
                "message": self.detail(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Warm-up problems are 503s; the client should retry. Inference failures
/// are request-scoped 500s.
impl From<TranscribeError> for AppError {
    fn from(err: TranscribeError) -> Self {
        match err {
            TranscribeError::WarmingUp | TranscribeError::Unavailable(_) => AppError::ServiceUnavailable(err.to_string()),
            TranscribeError::Inference(message) => AppError::Internal(message),
        }
    }
}

impl From<actix_web::error::BlockingError> for AppError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        AppError::Internal(format!("worker pool unavailable: {}", err))
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

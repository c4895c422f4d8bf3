//! # Error Handling
//!
//! Service-level error type and its mapping to HTTP responses.
//!
//! Domain modules define their own `thiserror` enums (`TurnError`,
//! `SessionError`, `InferenceError`, `ConversationError`); handlers convert
//! them into [`AppError`] with `?`, and actix renders the result through
//! [`ResponseError`].
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "bad_request",
//!     "message": "Missing required fields",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use crate::conversation::ConversationError;
use crate::session::SessionError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    /// Server-side failure (500)
    Internal(String),

    /// Malformed or incomplete request (400)
    BadRequest(String),

    /// Unknown session or resource (404)
    NotFound(String),

    /// Quota exhausted or capacity reached (403)
    Forbidden(String),

    /// The inference provider failed (502)
    Upstream(String),

    /// The session already has a turn in flight (409)
    Conflict(String),

    /// Configuration could not be loaded (500)
    ConfigError(String),

    /// A value failed validation (400)
    ValidationError(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.as_str()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg.as_str()),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "upstream_error", msg.as_str()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.as_str()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.as_str()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.as_str()),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            AppError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
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

/// Malformed JSON is the client's fault.
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

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound { .. } => AppError::NotFound(err.to_string()),
            SessionError::NotAPrefix { .. } => AppError::ValidationError(err.to_string()),
            SessionError::MissingField(_) => AppError::BadRequest(err.to_string()),
            SessionError::Poisoned => AppError::Internal(err.to_string()),
        }
    }
}

impl From<ConversationError> for AppError {
    fn from(err: ConversationError) -> Self {
        match err {
            ConversationError::Session(e) => e.into(),
            ConversationError::Inference(e) => AppError::Upstream(e.to_string()),
            ConversationError::EmptyMessage => AppError::BadRequest("Missing required fields".to_string()),
            busy @ ConversationError::Busy { .. } => AppError::Conflict(busy.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

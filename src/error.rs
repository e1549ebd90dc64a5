//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - [`AppError`]: errors returned from HTTP handlers, converted into JSON
//!   responses through actix's `ResponseError` trait.
//! - [`RelayError`]: the voice-relay taxonomy. Lifecycle and credential
//!   errors are surfaced to the originating connection as a `nova-error`
//!   event; line-level errors (`MalformedEvent`, `Decode`) are logged and
//!   dropped where they occur.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **Unauthorized**: Missing or rejected bearer token (401 errors)
/// - **ServiceUnavailable**: Connection limit reached (503 errors)
/// - **ConfigError**: Configuration problems (500 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Bearer token missing or failed verification
    Unauthorized(String),

    /// The relay cannot take another connection right now
    ServiceUnavailable(String),

    /// Configuration file or environment variable problems
    ConfigError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

/// Converts errors into HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "unauthorized",
///     "message": "Authentication failed",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::Unauthorized(msg) => (
                actix_web::http::StatusCode::UNAUTHORIZED,
                "unauthorized",
                msg.clone(),
            ),
            AppError::ServiceUnavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
        };

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

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Authentication(_) => AppError::Unauthorized("Authentication failed".to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Type alias for Results that use the HTTP error type.
pub type AppResult<T> = Result<T, AppError>;

/// Failures of the voice relay itself.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Bad, expired or unverifiable bearer token. No session is created.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The identity pool was unreachable or refused the token.
    #[error("credential exchange failed: {0}")]
    CredentialExchange(String),

    /// Neither the primary nor the fallback command could be spawned.
    #[error("voice process failed to start: {0}")]
    ProcessStart(String),

    /// The voice process exited or one of its streams failed.
    #[error("voice process failed at runtime: {0}")]
    ProcessRuntime(String),

    /// A line from the voice process could not be interpreted.
    #[error("malformed event from voice process: {0}")]
    MalformedEvent(String),

    /// The text-generation service was unreachable or refused the request.
    #[error("text generation failed: {0}")]
    TextGeneration(String),

    /// An embedded payload (empathy data, PCM audio) was invalid.
    #[error("decode error: {0}")]
    Decode(String),
}

impl RelayError {
    /// Message safe to show the browser in a `nova-error` event.
    ///
    /// Internal details stay in the server log.
    pub fn client_message(&self) -> String {
        match self {
            RelayError::Authentication(_) => "Authentication failed".to_string(),
            RelayError::CredentialExchange(_) => {
                "Failed to authenticate with AWS services".to_string()
            }
            RelayError::ProcessStart(_) => "Failed to start voice system".to_string(),
            RelayError::ProcessRuntime(_) => "Voice system stopped unexpectedly".to_string(),
            RelayError::TextGeneration(_) => "Failed to generate response".to_string(),
            RelayError::MalformedEvent(msg) | RelayError::Decode(msg) => msg.clone(),
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

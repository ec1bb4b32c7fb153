//! # Error Handling
//!
//! Application error type and its conversion to HTTP responses.
//!
//! ## Error Families:
//! - **AppError**: what a handler returns; becomes a JSON error response
//! - **LiveError**: live-session and remote-model failures (see `live::error`)
//! - **HistoryError**: chat history persistence failures (see `history`)
//!
//! Both domain errors convert into `AppError` with `?`, so handlers never map
//! status codes by hand.

use crate::history::HistoryError;
use crate::live::LiveError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500)
/// - **BadRequest**: Client sent invalid data (400)
/// - **NotFound**: Requested resource doesn't exist (404)
/// - **ConfigError**: Configuration problems (500)
/// - **ValidationError**: Data validation failed (400)
/// - **Unauthorized**: The hosted model rejected the credential (401); the UI
///   asks the user to reselect an API key
/// - **Upstream**: The hosted model failed or returned nothing usable (502)
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::BadRequest("Text must not be empty".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    Unauthorized(String),

    /// `kind` is the machine-readable type in the response body.
    Upstream { kind: &'static str, message: String },
}

impl AppError {
    pub fn upstream(message: impl Into<String>) -> Self {
        AppError::Upstream {
            kind: "transport_failure",
            message: message.into(),
        }
    }

    /// Machine-readable error type, as sent to clients.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::Unauthorized(_) => "authorization_failure",
            AppError::Upstream { kind, .. } => kind,
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg)
            | AppError::Unauthorized(msg) => msg,
            AppError::Upstream { message, .. } => message,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Upstream { message, .. } => write!(f, "Upstream error: {}", message),
        }
    }
}

/// Converts errors into JSON responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "authorization_failure",
///     "message": "Requested entity was not found.",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Startup and configuration helpers return `anyhow::Error`.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Malformed JSON is almost always the client's fault, hence 400.
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

/// Remote and live-session failures.
///
/// ## Mapping:
/// - AuthorizationFailure → 401, so the UI can start credential reselection
/// - TransportFailure / DecodeFailure → 502
/// - PermissionDenied / DeviceUnavailable / InvalidState → 400
impl From<LiveError> for AppError {
    fn from(err: LiveError) -> Self {
        match err {
            LiveError::AuthorizationFailure(msg) => AppError::Unauthorized(msg),
            LiveError::TransportFailure(msg) => AppError::upstream(msg),
            LiveError::DecodeFailure(msg) => AppError::Upstream {
                kind: "decode_failure",
                message: msg,
            },
            other => AppError::BadRequest(other.to_string()),
        }
    }
}

impl From<HistoryError> for AppError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::NotFound(id) => AppError::NotFound(format!("Chat session not found: {}", id)),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Shorthand for `Result<T, AppError>` in handlers.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_authorization_failure_is_401_with_type() {
        let err: AppError = LiveError::from_remote_message("Requested entity was not found.").into();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);

        let body = to_bytes(err.error_response().into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "authorization_failure");
        assert!(value["error"]["timestamp"].is_string());
    }

    #[test]
    fn test_status_mapping() {
        let transport: AppError = LiveError::TransportFailure("reset".to_string()).into();
        assert_eq!(transport.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(transport.error_type(), "transport_failure");

        let missing: AppError = HistoryError::NotFound("abc".to_string()).into();
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

        let version: AppError = HistoryError::UnsupportedVersion(9).into();
        assert_eq!(version.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
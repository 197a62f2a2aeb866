use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error types with appropriate HTTP status codes.
///
/// Rate-limit denials are not errors: they are decisions produced by the
/// trust gate and rendered as 429 responses there.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Errors raised by a [`crate::store::RateLimitStore`] round trip.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store operation `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("store circuit breaker is open")]
    CircuitOpen,

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("malformed record at `{key}`: {reason}")]
    Malformed { key: String, reason: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Session token failures.
///
/// Every variant is reported to clients as the same "unauthorized" response;
/// the distinction exists for logs, metrics and tests.
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,

    #[error("token is not valid yet")]
    NotYetValid,

    #[error("token is malformed: {0}")]
    Malformed(String),

    #[error("token version {token} does not match current version {current}")]
    VersionMismatch { token: u64, current: u64 },

    #[error("password changed after the token was issued")]
    PasswordChanged,

    #[error("token subject is not a known user")]
    UnknownUser,

    #[error("failed to sign token: {0}")]
    Signing(String),

    #[error("user directory unavailable: {0}")]
    Directory(#[from] StoreError),
}

impl TokenError {
    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TokenError::Expired => "expired",
            TokenError::NotYetValid => "not_yet_valid",
            TokenError::Malformed(_) => "malformed",
            TokenError::VersionMismatch { .. } => "version_mismatch",
            TokenError::PasswordChanged => "password_changed",
            TokenError::UnknownUser => "unknown_user",
            TokenError::Signing(_) => "signing",
            TokenError::Directory(_) => "directory",
        }
    }
}

/// `Authorization` header failures, distinct from token failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerError {
    #[error("authorization header required")]
    Missing,

    #[error("authorization header must use the Bearer scheme")]
    InvalidScheme,

    #[error("bearer token is empty")]
    EmptyToken,
}

impl BearerError {
    /// True for a header that was present but badly formatted.
    pub fn is_format_error(&self) -> bool {
        matches!(self, BearerError::InvalidScheme | BearerError::EmptyToken)
    }
}

/// Error response body for API endpoints.
#[derive(Serialize)]
pub(crate) struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub(crate) fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Full details stay in the logs, clients get sanitized messages
        tracing::error!(error = %self, "Request failed");

        let (status, error_type, message) = match &self {
            AppError::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                "Access-control store is temporarily unavailable. Please try again later.",
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An internal error occurred. Please contact support if the issue persists.",
            ),
            AppError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                "Service configuration error. Please contact support.",
            ),
            AppError::SerializationError(_) => (
                StatusCode::BAD_REQUEST,
                "serialization_error",
                "Malformed JSON in request body",
            ),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg.as_str()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
        };

        (status, axum::Json(ErrorResponse::new(error_type, message))).into_response()
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

//! Error types and HTTP response conversion

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Every error kind the gateway recognises.
///
/// One variant per kind in the error-handling design, plus wrapped
/// external-dependency errors (KV client, token library, JSON, HTTP).
#[derive(Debug, Error)]
pub enum Error {
    /// Missing/invalid/expired credential.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Token was well-formed but has expired.
    #[error("credential expired")]
    Expired,

    /// Role lacks permission for the requested operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Handshake or request session does not match the tracked session.
    #[error("session mismatch")]
    SessionMismatch,

    /// No session is tracked for this user yet.
    #[error("no session")]
    NoSession,

    /// Unknown session/user/route.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate registration or other conflicting write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed request body or query.
    #[error("validation error: {0}")]
    Validation(String),

    /// Caller is being rate limited.
    #[error("rate limit exceeded")]
    RateLimited {
        /// Hint, in seconds, for when the caller may retry.
        retry_after_secs: u64,
    },

    /// Upstream call failed in a way that maps to a gateway-facing error.
    #[error("upstream error: {0}")]
    Upstream(UpstreamError),

    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(String),

    /// KV client error (connection, pool, command).
    #[error("kv error: {0}")]
    Kv(#[from] deadpool_redis::redis::RedisError),

    /// Deadpool redis error (pool exhaustion, build failure).
    #[error("kv pool error: {0}")]
    KvPool(String),

    /// Token library error.
    #[error("token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Upstream HTTP client error.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Any otherwise-unhandled fault.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Normalised upstream-call failure, per C10.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// The circuit breaker for this upstream is open.
    BreakerOpen,
    /// Upstream returned a non-retried 4xx.
    Http(u16, String),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BreakerOpen => write!(f, "CIRCUIT_BREAKER_OPEN"),
            Self::Http(code, msg) => write!(f, "HTTP_{code}: {msg}"),
        }
    }
}

/// Uniform error envelope returned to HTTP clients and written to logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub detail: String,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
    pub path: Option<String>,
}

impl ErrorEnvelope {
    fn new(status: StatusCode, error: &str, detail: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            detail: detail.into(),
            status_code: status.as_u16(),
            timestamp: Utc::now(),
            path: None,
        }
    }

    /// Attach the request path this error occurred on.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl Error {
    /// Map this error to its HTTP status and envelope, without consuming
    /// response-building — used by both `IntoResponse` and WS error frames.
    pub fn status_and_envelope(&self) -> (StatusCode, ErrorEnvelope) {
        match self {
            Error::Auth(msg) => (
                StatusCode::UNAUTHORIZED,
                ErrorEnvelope::new(StatusCode::UNAUTHORIZED, "AUTH_ERROR", msg.clone()),
            ),
            Error::Expired => (
                StatusCode::UNAUTHORIZED,
                ErrorEnvelope::new(StatusCode::UNAUTHORIZED, "TOKEN_EXPIRED", "credential expired"),
            ),
            Error::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                ErrorEnvelope::new(StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
            ),
            Error::SessionMismatch => (
                StatusCode::BAD_REQUEST,
                ErrorEnvelope::new(StatusCode::BAD_REQUEST, "SESSION_MISMATCH", "session mismatch"),
            ),
            Error::NoSession => (
                StatusCode::BAD_REQUEST,
                ErrorEnvelope::new(StatusCode::BAD_REQUEST, "NO_SESSION", "no session tracked"),
            ),
            Error::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorEnvelope::new(StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ),
            Error::Conflict(msg) => (
                StatusCode::CONFLICT,
                ErrorEnvelope::new(StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            ),
            Error::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorEnvelope::new(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", msg.clone()),
            ),
            Error::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorEnvelope::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMITED",
                    format!("retry after {retry_after_secs}s"),
                ),
            ),
            Error::Upstream(UpstreamError::BreakerOpen) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorEnvelope::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "CIRCUIT_BREAKER_OPEN",
                    "upstream temporarily unavailable",
                ),
            ),
            Error::Upstream(UpstreamError::Http(code, msg)) => (
                StatusCode::BAD_GATEWAY,
                ErrorEnvelope::new(StatusCode::BAD_GATEWAY, &format!("HTTP_{code}"), msg.clone()),
            ),
            Error::Config(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorEnvelope::new(StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", msg.clone()),
            ),
            Error::Kv(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorEnvelope::new(StatusCode::INTERNAL_SERVER_ERROR, "KV_ERROR", e.to_string()),
            ),
            Error::KvPool(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorEnvelope::new(StatusCode::INTERNAL_SERVER_ERROR, "KV_POOL_ERROR", msg.clone()),
            ),
            Error::Jwt(e) => (
                StatusCode::UNAUTHORIZED,
                ErrorEnvelope::new(StatusCode::UNAUTHORIZED, "INVALID_TOKEN", e.to_string()),
            ),
            Error::Json(e) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorEnvelope::new(StatusCode::UNPROCESSABLE_ENTITY, "INVALID_JSON", e.to_string()),
            ),
            Error::Http(e) => (
                StatusCode::BAD_GATEWAY,
                ErrorEnvelope::new(StatusCode::BAD_GATEWAY, "UPSTREAM_HTTP_ERROR", e.to_string()),
            ),
            Error::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorEnvelope::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone()),
            ),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, envelope) = self.status_and_envelope();

        if status.is_server_error() {
            tracing::error!(status = %status, error = %envelope.error, detail = %envelope.detail, "request failed");
        } else if matches!(self, Error::SessionMismatch) {
            tracing::debug!(status = %status, "session mismatch");
        } else {
            tracing::warn!(status = %status, error = %envelope.error, detail = %envelope.detail, "request rejected");
        }

        (status, Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_maps_to_401() {
        let err = Error::Auth("missing token".into());
        let (status, envelope) = err.status_and_envelope();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(envelope.error, "AUTH_ERROR");
    }

    #[test]
    fn breaker_open_maps_to_503() {
        let err = Error::Upstream(UpstreamError::BreakerOpen);
        let (status, envelope) = err.status_and_envelope();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(envelope.error, "CIRCUIT_BREAKER_OPEN");
    }

    #[test]
    fn session_mismatch_maps_to_400() {
        let err = Error::SessionMismatch;
        let (status, _) = err.status_and_envelope();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn envelope_carries_path() {
        let envelope = ErrorEnvelope::new(StatusCode::NOT_FOUND, "NOT_FOUND", "x").with_path("/a/b");
        assert_eq!(envelope.path.as_deref(), Some("/a/b"));
    }
}

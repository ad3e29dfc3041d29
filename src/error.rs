//! # Error Handling
//!
//! This module defines the error taxonomy for the call bridge and how errors
//! are converted to HTTP responses.
//!
//! ## Error Categories:
//! - **Network**: transport-level failures (retryable with backoff)
//! - **Auth**: bad or malformed provider credentials (not retryable)
//! - **Config**: configuration problems, including an AI-agent audio-format
//!   mismatch with the configured system format (not retryable; requires
//!   reconfiguration)
//! - **RateLimit**: provider throttling (retryable after the provider delay)
//! - **Service**: generic upstream failure (retryable, may trigger fallback)
//! - **BadRequest / NotFound / Internal**: ambient web-layer errors
//!
//! ## Propagation Policy:
//! Transient per-frame send failures are dropped-and-continued: live audio
//! beats completeness. Connection-level failures escalate through the
//! resilience supervisor; only pre-call errors (bad credentials, malformed
//! numbers, audio-format mismatch) surface as upfront HTTP failures.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Custom error type for the application.
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::Auth("account id must be 34 characters".to_string()));
/// ```
#[derive(Debug, Clone)]
pub enum AppError {
    /// Transport-level failure reaching a provider (DNS, TCP, TLS, timeout)
    Network(String),

    /// Credential validation or provider authentication failure
    Auth(String),

    /// Configuration file, environment, or format-compatibility problems
    Config(String),

    /// Provider throttling; `retry_after` is the provider-specified delay
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Generic upstream service failure
    Service(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Internal server errors
    Internal(String),
}

impl AppError {
    /// Whether the failure class is worth retrying at all.
    ///
    /// Auth and Config errors need human intervention; retrying them only
    /// burns the reconnection budget.
    pub fn retryable(&self) -> bool {
        match self {
            AppError::Network(_) | AppError::RateLimit { .. } | AppError::Service(_) => true,
            AppError::Auth(_)
            | AppError::Config(_)
            | AppError::BadRequest(_)
            | AppError::NotFound(_)
            | AppError::Internal(_) => false,
        }
    }

    /// Provider-mandated delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AppError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Network(msg) => write!(f, "Network error: {}", msg),
            AppError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::RateLimit { message, .. } => write!(f, "Rate limited: {}", message),
            AppError::Service(msg) => write!(f, "Service error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

/// Converts application errors into consistent JSON HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - Auth → 401
/// - BadRequest → 400
/// - NotFound → 404
/// - RateLimit → 429
/// - Network/Service → 502 (the upstream provider failed, not the caller)
/// - Config/Internal → 500
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Network(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "network_error",
                msg.clone(),
            ),
            AppError::Auth(msg) => (
                actix_web::http::StatusCode::UNAUTHORIZED,
                "auth_error",
                msg.clone(),
            ),
            AppError::Config(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::RateLimit { message, .. } => (
                actix_web::http::StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                message.clone(),
            ),
            AppError::Service(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "service_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
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

/// JSON parsing failures are almost always malformed client/provider data.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// HTTP transport failures toward the telephony provider are network errors;
/// status-code mapping is done at the call site where the response is known.
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Network(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(AppError::Network("dns".to_string()).retryable());
        assert!(AppError::Service("upstream 503".to_string()).retryable());
        assert!(!AppError::Auth("bad token".to_string()).retryable());
        assert!(!AppError::Config("format mismatch".to_string()).retryable());
    }

    #[test]
    fn test_rate_limit_retry_after() {
        let err = AppError::RateLimit {
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(err.retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(AppError::Network("x".to_string()).retry_after(), None);
    }

    #[test]
    fn test_display_includes_message() {
        let err = AppError::Auth("account id rejected".to_string());
        assert!(err.to_string().contains("account id rejected"));
    }
}

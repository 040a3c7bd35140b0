use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::utils::sanitize::sanitize_error_message;

/// Classified failure from an external provider (embedding / LLM / web
/// search / email). Adapters classify once; the retry loop branches on
/// `kind` instead of sniffing message substrings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Upstream 429 or explicit rate-limit signal.
    RateLimited,
    /// Request or connect timeout.
    Timeout,
    /// Upstream 503 or provider-saturation signal.
    Saturated,
    /// Connection refused / DNS / transport-level failure.
    Unavailable,
    /// 401/403 from the provider: key rejected.
    BadKey,
    /// Provider-side quota exhausted.
    QuotaExceeded,
    /// Non-JSON body, unknown payload shape, dimension mismatch.
    BadResponse,
    Generic,
}

impl ProviderErrorKind {
    /// Only transient kinds are worth retrying; everything else fails fast.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Timeout | Self::Saturated | Self::Unavailable
        )
    }

    /// Client-safe message for the kind. Never includes the raw cause.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::RateLimited => "The AI provider is rate limiting requests. Please retry shortly.",
            Self::Timeout => "The AI provider timed out. Please retry.",
            Self::Saturated => "The AI provider is overloaded. Please retry shortly.",
            Self::Unavailable => "The AI provider is unreachable. Please check your configuration.",
            Self::BadKey => "The configured API key was rejected. Please update your settings.",
            Self::QuotaExceeded => "Your provider quota is exhausted.",
            Self::BadResponse => "The AI provider returned an unexpected response.",
            Self::Generic => "An internal error occurred. Please try again.",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a reqwest transport error.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else if err.is_connect() {
            ProviderErrorKind::Unavailable
        } else {
            ProviderErrorKind::Generic
        };
        Self::new(kind, err.to_string())
    }

    /// Classify an HTTP error status from a provider.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let kind = match status.as_u16() {
            429 => ProviderErrorKind::RateLimited,
            401 | 403 => ProviderErrorKind::BadKey,
            402 => ProviderErrorKind::QuotaExceeded,
            503 => ProviderErrorKind::Saturated,
            _ => ProviderErrorKind::Generic,
        };
        Self::new(kind, format!("{}: {}", status, body))
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Auth(String),

    #[error("{0}")]
    AccessDenied(String),

    #[error("{0}")]
    ExpiredSession(String),

    #[error("Rate limit exceeded. Retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("Database connection pool exhausted")]
    PoolExhausted,

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Ingest failed: {0}")]
    Ingest(String),

    #[error("API configuration missing: save your API settings first")]
    ConfigMissing,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => ApiError::PoolExhausted,
            other => ApiError::Database(other.to_string()),
        }
    }
}

/// Error envelope for every non-2xx response.
#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Validation(msg) => {
                tracing::warn!("Validation error: {}", msg);
                (StatusCode::BAD_REQUEST, msg)
            }
            ApiError::Auth(msg) => {
                tracing::warn!("Unauthorized: {}", msg);
                (StatusCode::UNAUTHORIZED, msg)
            }
            ApiError::AccessDenied(msg) => {
                tracing::warn!("Access denied: {}", msg);
                (StatusCode::NOT_FOUND, msg)
            }
            ApiError::ExpiredSession(msg) => {
                tracing::warn!("Expired session: {}", msg);
                (StatusCode::BAD_REQUEST, msg)
            }
            ApiError::RateLimited { retry_after } => {
                tracing::warn!(retry_after, "Rate limited");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    format!("Rate limit exceeded. Retry after {}s", retry_after),
                )
            }
            ApiError::PoolExhausted => {
                tracing::error!("Connection pool exhausted");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Service temporarily unavailable".to_string(),
                )
            }
            ApiError::Provider(err) => {
                tracing::error!(kind = ?err.kind, "Provider error: {}", err.message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    err.kind.user_message().to_string(),
                )
            }
            ApiError::Ingest(msg) => {
                tracing::error!("Ingest error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    sanitize_error_message(&msg),
                )
            }
            ApiError::ConfigMissing => (
                StatusCode::BAD_REQUEST,
                "API configuration missing: save your API settings first".to_string(),
            ),
            ApiError::Database(msg) => {
                tracing::error!("Database error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred. Please try again.".to_string(),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    sanitize_error_message(&msg),
                )
            }
        };

        (status, Json(ErrorResponse { detail })).into_response()
    }
}

//! API error taxonomy.
//!
//! Every error surfaced to a client carries a stable `error_code` (for client
//! logic) and a human-readable message free of PII. Signal-level failures
//! inside the scoring pipeline never reach this type; they are logged and the
//! signal degrades to neutral.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    /// Schema or validation failure (400).
    InvalidRequest(String),
    /// Missing or unknown API key (401).
    Unauthorized,
    /// Tenant exists but is not active (403).
    Forbidden,
    /// Transaction or resource absent (404).
    NotFound(String),
    /// Semantically invalid but well-formed input (422).
    Unprocessable(String),
    /// Per-tenant rate limit exceeded (429).
    RateLimited { retry_after_secs: u64 },
    /// The durable store is the blocker; the decision cannot be recorded (503).
    DependencyUnavailable(String),
    /// Uncaught internal failure (500).
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Unprocessable(_) => "unprocessable",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::DependencyUnavailable(_) => "dependency_unavailable",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::InvalidRequest(msg) => msg.clone(),
            ApiError::Unauthorized => "Missing or invalid API key".to_string(),
            ApiError::Forbidden => "Tenant is not active".to_string(),
            ApiError::NotFound(what) => format!("{} not found", what),
            ApiError::Unprocessable(msg) => msg.clone(),
            ApiError::RateLimited { retry_after_secs } => format!(
                "Rate limit exceeded, retry after {}s",
                retry_after_secs
            ),
            ApiError::DependencyUnavailable(_) => {
                "Service temporarily unavailable".to_string()
            }
            ApiError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error_code": self.code(),
            "message": self.message(),
        });

        match self {
            ApiError::RateLimited { retry_after_secs } => (
                self.status(),
                [("Retry-After", retry_after_secs.to_string())],
                Json(body),
            )
                .into_response(),
            _ => (self.status(), Json(body)).into_response(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for ApiError {}

//! Gateway error kinds and their HTTP mapping.
//!
//! Every fallible route handler returns [`ApiError`]; the body shape is
//! `{error, detail}` with `request_id` injected by the request-context
//! middleware so streaming responses are never touched.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::engines::EngineError;

/// Error kinds surfaced by the HTTP API.
#[derive(Debug, Error, Clone)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    RateLimited(String),

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::Unauthorized(_) => "Unauthorized",
            ApiError::Forbidden(_) => "Forbidden",
            ApiError::NotFound(_) => "NotFound",
            ApiError::Conflict(_) => "Conflict",
            ApiError::RateLimited(_) => "RateLimited",
            ApiError::Upstream(_) => "Upstream",
            ApiError::ServiceUnavailable(_) => "ServiceUnavailable",
            ApiError::Timeout(_) => "Timeout",
            ApiError::Internal(_) => "Internal",
        }
    }

    /// Detail string shown to the caller. Internal errors keep their message
    /// out of the body; the full context is logged with the request id.
    fn public_detail(&self) -> String {
        match self {
            ApiError::Internal(_) => "Internal Server Error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            tracing::error!(detail = %detail, "internal error");
        } else {
            tracing::warn!(kind = self.kind(), detail = %self, "request failed");
        }
        let body = serde_json::json!({
            "error": self.kind(),
            "detail": self.public_detail(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::CollectionNotFound { name } => {
                ApiError::NotFound(format!("collection not found: {name}"))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

//! Gateway error types and the JSON error envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the gateway, client-facing and infrastructure alike.
///
/// Every variant maps to a stable `code` string carried in the JSON envelope
/// so callers can branch on the taxonomy instead of parsing messages.
#[derive(Error, Debug)]
pub enum GatewayError {
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
    BadGateway(String),

    #[error("{0}")]
    UpstreamError(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

/// Wire form of a gateway-originated error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl GatewayError {
    /// Stable taxonomy code rendered into the envelope.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::BadGateway(_) => "bad_gateway",
            GatewayError::UpstreamError(_) => "upstream_error",
            GatewayError::ServiceUnavailable(_) => "service_unavailable",
            GatewayError::Config(_) | GatewayError::Io(_) | GatewayError::Internal(_) => {
                "internal_error"
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::BadGateway(_) | GatewayError::UpstreamError(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Config(_) | GatewayError::Io(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
            details: None,
        };
        (self.status_code(), Json(body)).into_response()
    }
}

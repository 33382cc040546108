//! Application error types and their HTTP mapping.
//!
//! Only validation problems and genuinely unexpected conditions become HTTP
//! errors. Upstream failures are absorbed by the backend adapter and never
//! reach this type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

/// Message returned to clients for any unexpected internal failure.
pub const GENERIC_INTERNAL_MESSAGE: &str = "Internal server error";

/// Error model used by configuration loading and request handling.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Creates a `400 Bad Request` validation error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Creates a `503 Service Unavailable` error.
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable(message.into())
    }

    /// Creates a generic internal server error.
    ///
    /// The message is logged server-side and never sent to the client.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Failure talking to an upstream inference backend.
///
/// Each variant is a distinct failure mode so logs and tests can tell them
/// apart, even though all of them collapse to the same fail-safe label.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed upstream payload: {0}")]
    Decode(String),
    #[error("upstream response contained no choices")]
    EmptyChoices,
    #[error("stream interrupted: {0}")]
    Stream(String),
}

impl UpstreamError {
    /// Short, stable name of the failure mode for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Request(_) => "request",
            Self::Status { .. } => "status",
            Self::Decode(_) => "decode",
            Self::EmptyChoices => "empty_choices",
            Self::Stream(_) => "stream",
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    detail: String,
    error_type: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::InvalidRequest(detail) => (
                StatusCode::BAD_REQUEST,
                ErrorPayload {
                    detail,
                    error_type: "VALIDATION_ERROR",
                },
            ),
            AppError::ServiceUnavailable(detail) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorPayload {
                    detail,
                    error_type: "SERVICE_UNAVAILABLE",
                },
            ),
            AppError::Internal(detail) => {
                error!(error = %detail, "unexpected internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorPayload {
                        detail: GENERIC_INTERNAL_MESSAGE.to_string(),
                        error_type: "INTERNAL_ERROR",
                    },
                )
            }
        };

        (status, Json(payload)).into_response()
    }
}

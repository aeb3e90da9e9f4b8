//! Error types for the API server.

use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hydra_core::Error as CoreError;
use serde::Serialize;
use thiserror::Error;

/// Result type alias for server operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors that can occur in the API server.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    /// Configuration file is unreadable or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Request body could not be decoded.
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Error raised by the provisioning core.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl ApiError {
    /// Status code and error kind for the response body.
    #[must_use]
    pub const fn status(&self) -> (StatusCode, &'static str) {
        match self {
            Self::InvalidBody(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::BindFailed(_, _) | Self::Config(_) | Self::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
            Self::Core(err) => match err {
                CoreError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
                CoreError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "unauthenticated"),
                CoreError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
                CoreError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
                CoreError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
                CoreError::NotSynced(_) => (StatusCode::SERVICE_UNAVAILABLE, "not_synced"),
                CoreError::Platform(_)
                | CoreError::Identity(_)
                | CoreError::Unsupported(_)
                | CoreError::Config(_)
                | CoreError::CatalogParse(_)
                | CoreError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };

        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"error":"internal_error","message":"failed to serialize error"}"#.to_string()
        });

        (status, [("content-type", "application/json")], json).into_response()
    }
}

impl From<axum::extract::rejection::JsonRejection> for ApiError {
    fn from(rejection: axum::extract::rejection::JsonRejection) -> Self {
        Self::InvalidBody(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use test_case::test_case;

    #[test_case(CoreError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST ; "invalid request")]
    #[test_case(
        CoreError::Unauthenticated("x".into()),
        StatusCode::UNAUTHORIZED ;
        "unauthenticated"
    )]
    #[test_case(CoreError::Forbidden("x".into()), StatusCode::FORBIDDEN ; "forbidden")]
    #[test_case(CoreError::not_found("user", "x"), StatusCode::NOT_FOUND ; "not found")]
    #[test_case(CoreError::Conflict("x".into()), StatusCode::CONFLICT ; "conflict")]
    #[test_case(CoreError::Platform("x".into()), StatusCode::INTERNAL_SERVER_ERROR ; "platform")]
    #[test_case(CoreError::NotSynced("x".into()), StatusCode::SERVICE_UNAVAILABLE ; "not synced")]
    fn test_core_error_status(err: CoreError, expected: StatusCode) {
        assert_eq!(ApiError::from(err).into_response().status(), expected);
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = ApiError::from(CoreError::not_found("device", "alice")).into_response();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["error"], "not_found");
        assert_eq!(json["message"], "device not found: alice");
    }

    #[test]
    fn test_error_display() {
        let err = ApiError::InvalidBody("missing field".to_string());
        assert_eq!(err.to_string(), "invalid request body: missing field");
    }
}

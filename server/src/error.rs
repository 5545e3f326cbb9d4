//! Error types for the gateway and the REST surface

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_shared::{ProtocolError, StoreError};
use thiserror::Error;
use tracing::error;

/// Failures while handling a real-time event
///
/// Only the status code reaches the client; the message is logged.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("frame could not be decoded: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("connection has not identified")]
    NotIdentified,

    #[error("credential rejected for {0}")]
    BadCredential(String),

    #[error("connection already identified as another account")]
    AlreadyIdentified,

    #[error("sender {claimed} does not match identified account {actual}")]
    SenderMismatch { claimed: String, actual: String },

    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("rate limit exceeded")]
    RateLimited,
}

impl GatewayError {
    /// HTTP-style status code sent in the `error` event
    pub fn code(&self) -> u16 {
        match self {
            GatewayError::Malformed(_) => 400,
            GatewayError::NotIdentified | GatewayError::BadCredential(_) => 401,
            GatewayError::AlreadyIdentified | GatewayError::SenderMismatch { .. } => 403,
            GatewayError::TooLarge(_) => 413,
            GatewayError::RateLimited => 429,
        }
    }

    /// Client-safe description
    pub fn public_message(&self) -> &'static str {
        match self {
            GatewayError::RateLimited => "Slow down",
            GatewayError::NotIdentified | GatewayError::BadCredential(_) => "Not identified",
            _ => "Request failed",
        }
    }
}

/// REST failures, rendered as `{"error": "..."}`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("missing or invalid credential")]
    Unauthorized,

    #[error("not allowed")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::Invalid(_)) => StatusCode::BAD_REQUEST,
            ApiError::Store(StoreError::Unauthorized) => StatusCode::FORBIDDEN,
            ApiError::Store(StoreError::Backend(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Storage failure: {}", self);
            "Request failed".to_string()
        } else {
            self.to_string()
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_codes() {
        assert_eq!(GatewayError::NotIdentified.code(), 401);
        assert_eq!(GatewayError::RateLimited.code(), 429);
        assert_eq!(GatewayError::TooLarge(1 << 20).code(), 413);
        assert_eq!(
            GatewayError::SenderMismatch {
                claimed: "a".into(),
                actual: "b".into()
            }
            .code(),
            403
        );
    }

    #[test]
    fn test_store_errors_map_to_status() {
        let status = |e: StoreError| ApiError::from(e).into_response().status();
        assert_eq!(status(StoreError::NotFound("thread".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(StoreError::Invalid("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(StoreError::Unauthorized), StatusCode::FORBIDDEN);
        assert_eq!(
            status(StoreError::Backend("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

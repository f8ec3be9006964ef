//! Client-facing error taxonomy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JSON body carried by every error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Errors surfaced to HTTP callers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("tunnel not found")]
    TunnelNotFound,

    #[error("tunnel has no attached agent")]
    TunnelNotConnected,

    #[error("tunnel is at its in-flight request limit")]
    TunnelBusy,

    #[error("timed out waiting for the agent")]
    RequestTimeout,

    #[error("upstream agent went away")]
    UpstreamGone,

    #[error("request body too large")]
    PayloadTooLarge,

    #[error("operator credential required")]
    Unauthorized,

    #[error("invalid operator credential")]
    Forbidden,

    #[error("too many requests")]
    Throttled,

    #[error("tunnel capacity reached")]
    CapacityExceeded,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::TunnelNotFound => StatusCode::NOT_FOUND,
            ApiError::TunnelNotConnected | ApiError::TunnelBusy | ApiError::CapacityExceeded => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::UpstreamGone => StatusCode::BAD_GATEWAY,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Throttled => StatusCode::TOO_MANY_REQUESTS,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::TunnelNotFound => "TUNNEL_NOT_FOUND",
            ApiError::TunnelNotConnected => "TUNNEL_NOT_CONNECTED",
            ApiError::TunnelBusy => "TUNNEL_BUSY",
            ApiError::RequestTimeout => "REQUEST_TIMEOUT",
            ApiError::UpstreamGone => "UPSTREAM_GONE",
            ApiError::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::Throttled => "THROTTLED",
            ApiError::CapacityExceeded => "CAPACITY_EXCEEDED",
            ApiError::InvalidRequest(_) => "INVALID_REQUEST",
            ApiError::Internal => "INTERNAL",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind().to_string(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::TunnelNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::TunnelNotConnected.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::TunnelBusy.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ApiError::RequestTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ApiError::UpstreamGone.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ApiError::PayloadTooLarge.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::Throttled.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ApiError::Internal.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(ApiError::TunnelNotConnected.kind(), "TUNNEL_NOT_CONNECTED");
        assert_eq!(ApiError::RequestTimeout.kind(), "REQUEST_TIMEOUT");
    }
}

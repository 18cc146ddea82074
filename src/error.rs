use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::time::Duration;

// Startup configuration failures; any of these aborts the process
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid rate `{rate}`: {reason}")]
    InvalidRate { rate: String, reason: String },

    #[error("expected NAME=VALUE, got `{0}`")]
    MalformedPair(String),

    #[error("route `{prefix}` refers to unknown scope `{scope}`")]
    UnknownRouteScope { prefix: String, scope: String },

    #[error("default scope `{0}` is not registered")]
    MissingDefaultScope(String),

    #[error("`{0}` is not a valid header name")]
    InvalidHeader(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("counting store unavailable: {0}")]
    Unavailable(String),

    #[error("counting store did not answer within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    #[error("unknown throttle scope `{0}`")]
    UnknownScope(String),

    #[error("throttle identity must not be empty")]
    EmptyIdentity,

    #[error(transparent)]
    Store(#[from] StoreError),
}

// Error returned by the gateway's own endpoints
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl From<ThrottleError> for ApiError {
    fn from(e: ThrottleError) -> Self {
        match e {
            ThrottleError::UnknownScope(_) | ThrottleError::EmptyIdentity => {
                ApiError::BadRequest(e.to_string())
            }
            ThrottleError::Store(inner) => ApiError::Unavailable(inner.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => {
                tracing::warn!("store unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            ApiError::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = ErrorBody {
            success: false,
            error: message,
        };
        (status, Json(body)).into_response()
    }
}

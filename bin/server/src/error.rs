//! Error types for server start-up and request handling.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt;

/// Failures while assembling the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupError {
    /// Configuration is missing or invalid.
    Configuration { reason: String },
    /// The provider backend could not be created.
    Provider,
    /// State buckets could not be opened.
    State,
    /// The job queue could not be opened.
    Queue,
    /// The tool catalog could not be loaded.
    Tools,
    /// An outbound adapter could not be created.
    Adapter,
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { reason } => write!(f, "invalid configuration: {reason}"),
            Self::Provider => write!(f, "failed to create provider backend"),
            Self::State => write!(f, "failed to open state buckets"),
            Self::Queue => write!(f, "failed to open job queue"),
            Self::Tools => write!(f, "failed to load tool catalog"),
            Self::Adapter => write!(f, "failed to create outbound adapter"),
        }
    }
}

impl std::error::Error for StartupError {}

/// Errors returned by HTTP handlers.
#[derive(Debug)]
pub enum ApiError {
    /// The identity in the path is not usable.
    InvalidIdentity,
    /// Nothing to act on.
    NotFound,
    /// Something failed server-side; details are logged, not returned.
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::InvalidIdentity => (StatusCode::BAD_REQUEST, "Invalid identity"),
            Self::NotFound => (StatusCode::NOT_FOUND, "Not found"),
            Self::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };

        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_error_display() {
        let err = StartupError::Configuration {
            reason: "missing api key".to_string(),
        };
        assert!(err.to_string().contains("missing api key"));
    }

    #[test]
    fn api_error_status_codes() {
        assert_eq!(
            ApiError::InvalidIdentity.into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::NotFound.into_response().status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Internal.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

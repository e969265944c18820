//! Error types for the admission-control and authorization layer.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Main error type for market-gate operations.
///
/// The first four variants are raised by request gates and ownership guards
/// and are always recoverable by the client. Each carries everything needed
/// to render a response without further lookups.
#[derive(Error, Debug)]
pub enum GateError {
    /// A throttling policy's ceiling was exceeded.
    #[error("{message}")]
    RateLimitExceeded {
        /// Human-readable policy description
        message: String,
        /// Whole seconds until the window resets
        retry_after_secs: u64,
    },

    /// No principal is attached where one is required.
    #[error("authentication required")]
    Unauthenticated,

    /// The principal is neither the resource owner nor unrestricted.
    #[error("you do not have permission to modify this resource")]
    Forbidden,

    /// The resource referenced by an ownership check does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The owner lookup backend failed for a reason other than a missing resource.
    #[error("owner lookup failed: {0}")]
    OwnerLookup(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for market-gate operations.
pub type Result<T> = std::result::Result<T, GateError>;

/// JSON body rendered for every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Human-readable error detail.
    pub message: String,
    /// Machine-readable error code (e.g. "rate_limit_exceeded", "forbidden").
    pub code: &'static str,
}

impl GateError {
    /// Machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            GateError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GateError::Unauthenticated => "unauthenticated",
            GateError::Forbidden => "forbidden",
            GateError::NotFound(_) => "not_found",
            GateError::OwnerLookup(_) => "owner_lookup_failed",
            GateError::Config(_) | GateError::Io(_) => "internal_error",
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            GateError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GateError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GateError::Forbidden => StatusCode::FORBIDDEN,
            GateError::NotFound(_) => StatusCode::NOT_FOUND,
            GateError::OwnerLookup(_) | GateError::Config(_) | GateError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "internal error while authorizing request");
        }

        let retry_after = match &self {
            GateError::RateLimitExceeded {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        };

        let body = ErrorBody {
            message: self.to_string(),
            code: self.code(),
        };
        let mut response = (status, axum::Json(body)).into_response();

        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

//! API error type and its HTTP mapping.
//!
//! Negative entitlement outcomes are not errors; they are 200 responses with
//! a reason. This type covers the failures that stop a request before or
//! outside the business rules.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;
use vivid_registry::RegistryError;
use vivid_types::wire::{ErrorBody, ErrorDetail};

/// Result type for request handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or invalid session token.
    #[error("{0}")]
    Unauthenticated(String),

    /// Missing or invalid app attestation.
    #[error("{0}")]
    FailedPrecondition(String),

    /// The session subject does not match the request's user.
    #[error("{0}")]
    PermissionDenied(String),

    /// Authenticated request whose body did not parse.
    #[error("{0}")]
    InvalidArgument(String),

    /// Registry or runtime failure that survived retries.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "unauthenticated",
            Self::FailedPrecondition(_) => "failed_precondition",
            Self::PermissionDenied(_) => "permission_denied",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        error!(error = %e, "registry failure");
        Self::Internal("registry unavailable".to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidArgument(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };
        (self.status(), Json(body)).into_response()
    }
}

//! Error types for the validation client.

use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the validation client.
///
/// Negative entitlement outcomes (expired, not found, abuse) are not errors;
/// they arrive as structured results.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No usable session token, or the server rejected it.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// No usable app attestation token, or the server rejected it.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The server refused the caller's identity for this resource.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// The request did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// The server answered with an error status.
    #[error("server error {status} ({code}): {message}")]
    Server {
        status: u16,
        code: String,
        message: String,
    },

    /// The session changed (sign-out) while the request was in flight.
    #[error("operation cancelled: session changed")]
    Cancelled,

    /// Local cache file error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Cache encryption error.
    #[error("crypto error: {0}")]
    Crypto(#[from] vivid_crypto::CryptoError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// True for failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Server { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// True when the failure means the server could not be reached, so the
    /// client falls back to its cache.
    pub fn is_offline(&self) -> bool {
        self.is_retryable()
    }
}

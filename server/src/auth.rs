//! Attestation and session token verification.
//!
//! Tokens have the form `base64url(payload).base64url(signature)`: an Ed25519
//! signature over the encoded payload string (not the decoded JSON). The
//! attestation token proves the request comes from a genuine app install;
//! the session token proves who the user is.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use vivid_types::wire::ATTESTATION_HEADER;

use crate::error::ApiError;
use crate::AppState;

/// Token verification failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token missing")]
    Missing,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("token issued for another app")]
    WrongApp,
}

/// Claims carried by an app attestation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationClaims {
    pub app_id: String,
    pub device_id: String,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Authenticated user id.
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Identity established for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    /// Installation id vouched for by the attestation token.
    pub device_id: String,
}

/// Verifies both token kinds against their public keys.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    attestation_key: VerifyingKey,
    session_key: VerifyingKey,
    app_id: String,
}

impl TokenVerifier {
    /// Builds a verifier from raw 32-byte Ed25519 public keys.
    pub fn from_bytes(
        attestation_key: &[u8; 32],
        session_key: &[u8; 32],
        app_id: impl Into<String>,
    ) -> Result<Self, TokenError> {
        let attestation_key = VerifyingKey::from_bytes(attestation_key)
            .map_err(|_| TokenError::Malformed("invalid attestation public key".into()))?;
        let session_key = VerifyingKey::from_bytes(session_key)
            .map_err(|_| TokenError::Malformed("invalid session public key".into()))?;
        Ok(Self::new(attestation_key, session_key, app_id))
    }

    #[must_use]
    pub fn new(
        attestation_key: VerifyingKey,
        session_key: VerifyingKey,
        app_id: impl Into<String>,
    ) -> Self {
        Self {
            attestation_key,
            session_key,
            app_id: app_id.into(),
        }
    }

    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Verifies an attestation token: signature, app id, then expiry.
    pub fn verify_attestation(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AttestationClaims, TokenError> {
        let claims: AttestationClaims = verify_signed(token, &self.attestation_key)?;
        if claims.app_id != self.app_id {
            return Err(TokenError::WrongApp);
        }
        check_expiry(claims.exp, now)?;
        Ok(claims)
    }

    /// Verifies a session token: signature, then expiry.
    pub fn verify_session(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionClaims, TokenError> {
        let claims: SessionClaims = verify_signed(token, &self.session_key)?;
        if claims.sub.is_empty() {
            return Err(TokenError::Malformed("empty subject".into()));
        }
        check_expiry(claims.exp, now)?;
        Ok(claims)
    }

    /// Checks the attestation token, then the session token.
    ///
    /// Runs before the request body is read, so an unauthenticated call is
    /// refused whatever its body holds.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> Result<Authenticated, ApiError> {
        let attestation = header_str(headers, ATTESTATION_HEADER)
            .ok_or(TokenError::Missing)
            .and_then(|t| self.verify_attestation(t, now))
            .map_err(|e| {
                debug!(error = %e, "attestation rejected");
                ApiError::FailedPrecondition(format!("app attestation rejected: {e}"))
            })?;

        let session = bearer_token(headers)
            .ok_or(TokenError::Missing)
            .and_then(|t| self.verify_session(t, now))
            .map_err(|e| {
                debug!(error = %e, "session rejected");
                ApiError::Unauthenticated(format!("session rejected: {e}"))
            })?;

        Ok(Authenticated {
            subject: session.sub,
            device_id: attestation.device_id,
        })
    }
}

/// Tokens of a request that passed [`TokenVerifier::authenticate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    /// Session subject.
    pub subject: String,
    /// Installation id from the attestation token.
    pub device_id: String,
}

impl Authenticated {
    /// Binds the session to the user named in the request body.
    pub fn for_user(self, user_id: &str) -> Result<Caller, ApiError> {
        if self.subject != user_id {
            debug!(subject = %self.subject, user_id, "session subject mismatch");
            return Err(ApiError::PermissionDenied(
                "session does not belong to the requested user".into(),
            ));
        }
        Ok(Caller {
            user_id: self.subject,
            device_id: self.device_id,
        })
    }
}

impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        state.verifier.authenticate(&parts.headers, state.clock.now())
    }
}

fn verify_signed<T: DeserializeOwned>(token: &str, key: &VerifyingKey) -> Result<T, TokenError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(TokenError::Missing);
    }
    let (payload_b64, signature_b64) = token
        .split_once('.')
        .ok_or_else(|| TokenError::Malformed("expected payload.signature".into()))?;

    let sig_bytes = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|e| TokenError::Malformed(format!("signature encoding: {e}")))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|_| TokenError::Malformed("signature length".into()))?;

    key.verify(payload_b64.as_bytes(), &signature)
        .map_err(|_| TokenError::InvalidSignature)?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|e| TokenError::Malformed(format!("payload encoding: {e}")))?;
    serde_json::from_slice(&payload).map_err(|e| TokenError::Malformed(format!("payload: {e}")))
}

fn check_expiry(exp: i64, now: DateTime<Utc>) -> Result<(), TokenError> {
    if now.timestamp() >= exp {
        return Err(TokenError::Expired);
    }
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "authorization")?.strip_prefix("Bearer ")
}

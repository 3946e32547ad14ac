//! Transport to the entitlement server.

use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;
use vivid_types::wire::{
    CreateReferralRequest, DetectAbuseRequest, ErrorBody, RecordGenerationRequest,
    RedeemReferralRequest, StartTrialRequest, ValidateTrialRequest, ATTESTATION_HEADER,
    CREATE_REFERRAL_PATH, DETECT_ABUSE_PATH, RECORD_GENERATION_PATH, REDEEM_REFERRAL_PATH,
    START_TRIAL_PATH, VALIDATE_TRIAL_PATH,
};
use vivid_types::{AbuseResult, ReferralCodeResponse, ReferralResult, TrialValidationResult};

/// Tokens attached to every request.
#[derive(Clone)]
pub struct Credentials {
    pub attestation: String,
    pub session: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("attestation", &"[REDACTED]")
            .field("session", &"[REDACTED]")
            .finish()
    }
}

/// A signed-in user and their session token.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub token: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Source of the attestation token and the current session.
///
/// The host app implements this over its platform attestation service and its
/// authentication layer.
pub trait CredentialProvider: Send + Sync {
    fn attestation_token(&self) -> Option<String>;
    fn session(&self) -> Option<Session>;
}

/// A [`CredentialProvider`] holding values set by the host.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    attestation: RwLock<Option<String>>,
    session: RwLock<Option<Session>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_attestation(&self, token: Option<String>) {
        *self.attestation.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub fn set_session(&self, session: Option<Session>) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session;
    }
}

impl CredentialProvider for StaticCredentials {
    fn attestation_token(&self) -> Option<String> {
        self.attestation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn session(&self) -> Option<Session> {
        self.session.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// The entitlement server's operations.
#[async_trait]
pub trait EntitlementApi: Send + Sync {
    async fn validate_trial(
        &self,
        credentials: &Credentials,
        request: &ValidateTrialRequest,
    ) -> ClientResult<TrialValidationResult>;

    async fn start_trial(
        &self,
        credentials: &Credentials,
        request: &StartTrialRequest,
    ) -> ClientResult<TrialValidationResult>;

    async fn record_generation(
        &self,
        credentials: &Credentials,
        request: &RecordGenerationRequest,
    ) -> ClientResult<TrialValidationResult>;

    async fn detect_abuse(
        &self,
        credentials: &Credentials,
        request: &DetectAbuseRequest,
    ) -> ClientResult<AbuseResult>;

    async fn create_referral(
        &self,
        credentials: &Credentials,
        request: &CreateReferralRequest,
    ) -> ClientResult<ReferralCodeResponse>;

    async fn redeem_referral(
        &self,
        credentials: &Credentials,
        request: &RedeemReferralRequest,
    ) -> ClientResult<ReferralResult>;
}

/// HTTP/JSON implementation of [`EntitlementApi`].
#[derive(Debug, Clone)]
pub struct HttpEntitlementApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpEntitlementApi {
    /// Creates a transport for `base_url` (e.g. `https://api.example.com`).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B, R>(&self, path: &str, credentials: &Credentials, body: &B) -> ClientResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .header(ATTESTATION_HEADER, &credentials.attestation)
            .bearer_auth(&credentials.session)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        debug!(%url, status = status.as_u16(), "entitlement API response");

        if status.is_success() {
            return response.json::<R>().await.map_err(map_transport_error);
        }

        let text = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.error.code, body.error.message),
            Err(_) => (String::from("unknown"), text),
        };
        Err(match status {
            StatusCode::UNAUTHORIZED => ClientError::Unauthenticated(message),
            StatusCode::PRECONDITION_FAILED => ClientError::FailedPrecondition(message),
            StatusCode::FORBIDDEN => ClientError::PermissionDenied(message),
            _ => ClientError::Server {
                status: status.as_u16(),
                code,
                message,
            },
        })
    }
}

fn map_transport_error(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout
    } else if e.is_decode() {
        ClientError::Server {
            status: e.status().map_or(200, |s| s.as_u16()),
            code: String::from("malformed_response"),
            message: e.to_string(),
        }
    } else {
        ClientError::Network(e.to_string())
    }
}

#[async_trait]
impl EntitlementApi for HttpEntitlementApi {
    async fn validate_trial(
        &self,
        credentials: &Credentials,
        request: &ValidateTrialRequest,
    ) -> ClientResult<TrialValidationResult> {
        self.post(VALIDATE_TRIAL_PATH, credentials, request).await
    }

    async fn start_trial(
        &self,
        credentials: &Credentials,
        request: &StartTrialRequest,
    ) -> ClientResult<TrialValidationResult> {
        self.post(START_TRIAL_PATH, credentials, request).await
    }

    async fn record_generation(
        &self,
        credentials: &Credentials,
        request: &RecordGenerationRequest,
    ) -> ClientResult<TrialValidationResult> {
        self.post(RECORD_GENERATION_PATH, credentials, request).await
    }

    async fn detect_abuse(
        &self,
        credentials: &Credentials,
        request: &DetectAbuseRequest,
    ) -> ClientResult<AbuseResult> {
        self.post(DETECT_ABUSE_PATH, credentials, request).await
    }

    async fn create_referral(
        &self,
        credentials: &Credentials,
        request: &CreateReferralRequest,
    ) -> ClientResult<ReferralCodeResponse> {
        self.post(CREATE_REFERRAL_PATH, credentials, request).await
    }

    async fn redeem_referral(
        &self,
        credentials: &Credentials,
        request: &RedeemReferralRequest,
    ) -> ClientResult<ReferralResult> {
        self.post(REDEEM_REFERRAL_PATH, credentials, request).await
    }
}

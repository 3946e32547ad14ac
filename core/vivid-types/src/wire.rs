//! Request and error bodies of the entitlement HTTP API.
//!
//! Field names are camelCase on the wire.

use crate::device::DeviceInfo;
use crate::trial::TrialType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Header carrying the app-integrity attestation token.
pub const ATTESTATION_HEADER: &str = "x-app-attestation";

pub const VALIDATE_TRIAL_PATH: &str = "/api/v1/trials/validate";
pub const START_TRIAL_PATH: &str = "/api/v1/trials/start";
pub const RECORD_GENERATION_PATH: &str = "/api/v1/trials/generation";
pub const DETECT_ABUSE_PATH: &str = "/api/v1/abuse/detect";
pub const CREATE_REFERRAL_PATH: &str = "/api/v1/referrals";
pub const REDEEM_REFERRAL_PATH: &str = "/api/v1/referrals/redeem";
pub const HEALTH_PATH: &str = "/api/v1/health";

/// Body of `validateTrial`.
///
/// `start_date` and `is_active` are the client's own view and are ignored by
/// the server; they remain in the body for compatibility with older clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateTrialRequest {
    pub device_id: String,
    /// Opaque to the client; echoes `TrialSnapshot::trial_id`.
    pub trial_id: String,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_active: Option<bool>,
    pub device_fingerprint: String,
    pub user_id: String,
}

/// Body of `startTrial`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTrialRequest {
    pub trial_type: TrialType,
    pub device_fingerprint: String,
    pub user_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_info: DeviceInfo,
}

/// Body of `recordGeneration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordGenerationRequest {
    pub trial_id: String,
    pub user_id: String,
}

/// Body of `detectAbuse`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectAbuseRequest {
    pub user_id: String,
    pub device_fingerprint: String,
    #[serde(default)]
    pub device_info: DeviceInfo,
}

/// Body of the referral code request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReferralRequest {
    pub user_id: String,
    pub device_fingerprint: String,
}

/// Body of a referral redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemReferralRequest {
    pub referral_code: String,
    pub user_id: String,
    pub device_fingerprint: String,
}

/// Error envelope returned with every non-2xx status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable code, e.g. `unauthenticated`.
    pub code: String,
    pub message: String,
}

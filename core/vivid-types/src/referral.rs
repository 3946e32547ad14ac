//! Referral records and redemption results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Referral code issued to a referrer.
///
/// `rewards_granted` is only ever raised by a server-side redemption; no API
/// accepts a reward count from a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralRecord {
    pub referral_code: String,
    pub referrer_id: String,
    pub referee_id: Option<String>,
    pub rewards_granted: u32,
    /// Fingerprint of the referrer's device when the code was issued.
    pub device_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub redeemed_at: Option<DateTime<Utc>>,
}

impl ReferralRecord {
    /// True once a referee has used this code.
    #[must_use]
    pub fn is_redeemed(&self) -> bool {
        self.referee_id.is_some()
    }
}

/// Response to a referral code request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralCodeResponse {
    pub referral_code: String,
    pub rewards_granted: u32,
}

/// Outcome of a redemption attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralResult {
    pub is_valid: bool,
    pub reason: Option<String>,
    /// Rewards now held by the referrer.
    pub rewards_granted: u32,
}

impl ReferralResult {
    #[must_use]
    pub fn redeemed(rewards_granted: u32) -> Self {
        Self {
            is_valid: true,
            reason: None,
            rewards_granted,
        }
    }

    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            reason: Some(reason.into()),
            rewards_granted: 0,
        }
    }
}

//! Trial records, the trial policy, and the validation result returned to
//! clients.

use crate::ids::TrialId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Human-readable reasons carried by negative validation results.
pub mod reasons {
    pub const TRIAL_NOT_FOUND: &str = "Trial not found";
    pub const TRIAL_EXPIRED: &str = "Trial expired";
    pub const ALREADY_ACTIVE: &str = "User already has an active trial";
    pub const NOT_OWNER: &str = "Trial does not belong to user";
    pub const VALIDATION_REQUIRED: &str = "Trial validation required";
    pub const REVALIDATION_REQUIRED: &str = "Re-validation required";
}

/// Kind of trial granted to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialType {
    /// Time-bounded and capped at a fixed number of generations.
    Limited,
    /// Time-bounded, no generation cap.
    Unlimited,
    /// Time-bounded with a small generation allowance.
    Freemium,
}

impl TrialType {
    /// Returns the lowercase wire/storage name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Limited => "limited",
            Self::Unlimited => "unlimited",
            Self::Freemium => "freemium",
        }
    }
}

impl fmt::Display for TrialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrialType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "limited" => Ok(Self::Limited),
            "unlimited" => Ok(Self::Unlimited),
            "freemium" => Ok(Self::Freemium),
            other => Err(crate::Error::InvalidTrialType(other.to_string())),
        }
    }
}

/// Server-side trial policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialPolicy {
    /// Trial length in days, for every trial type.
    pub duration_days: i64,
    /// Generation cap for `limited` trials.
    pub limited_max_generations: u32,
    /// Generation cap for `freemium` trials.
    pub freemium_max_generations: u32,
}

impl Default for TrialPolicy {
    fn default() -> Self {
        Self {
            duration_days: 3,
            limited_max_generations: 3,
            freemium_max_generations: 1,
        }
    }
}

impl TrialPolicy {
    /// Returns the trial duration.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::days(self.duration_days)
    }

    /// Returns the generation cap for a trial type. Zero means uncapped.
    #[must_use]
    pub fn max_generations(&self, trial_type: TrialType) -> u32 {
        match trial_type {
            TrialType::Limited => self.limited_max_generations,
            TrialType::Freemium => self.freemium_max_generations,
            TrialType::Unlimited => 0,
        }
    }
}

/// Formats the "used/max" usage message shown when a cap is reached.
#[must_use]
pub fn usage_summary(used: u32, max: u32) -> String {
    format!("{used}/{max} generations used")
}

/// Authoritative trial record held by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialRecord {
    pub trial_id: TrialId,
    pub user_id: String,
    pub device_id: String,
    pub device_fingerprint: String,
    pub trial_type: TrialType,
    pub start_date: DateTime<Utc>,
    pub is_active: bool,
    pub generations_used: u32,
    /// Zero for uncapped trials.
    pub max_generations: u32,
    pub server_validated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrialRecord {
    /// Creates a fresh, active, server-validated record starting at `now`.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        device_fingerprint: impl Into<String>,
        trial_type: TrialType,
        policy: &TrialPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            trial_id: TrialId::new(),
            user_id: user_id.into(),
            device_id: device_id.into(),
            device_fingerprint: device_fingerprint.into(),
            trial_type,
            start_date: now,
            is_active: true,
            generations_used: 0,
            max_generations: policy.max_generations(trial_type),
            server_validated: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns when the trial stops being valid.
    #[must_use]
    pub fn expires_at(&self, duration: Duration) -> DateTime<Utc> {
        self.start_date + duration
    }

    /// True once `now` is strictly past `start_date + duration`.
    #[must_use]
    pub fn is_expired_at(&self, duration: Duration, now: DateTime<Utc>) -> bool {
        now > self.expires_at(duration)
    }

    /// Whole days left, rounded up; zero once expired.
    #[must_use]
    pub fn days_remaining(&self, duration: Duration, now: DateTime<Utc>) -> i64 {
        days_until(self.expires_at(duration), now)
    }

    /// True when no more generations may be recorded against this trial.
    #[must_use]
    pub fn generations_exhausted(&self) -> bool {
        self.max_generations > 0 && self.generations_used >= self.max_generations
    }

    /// Builds the client-facing projection.
    #[must_use]
    pub fn snapshot(&self, duration: Duration) -> TrialSnapshot {
        TrialSnapshot {
            trial_id: self.trial_id,
            trial_type: self.trial_type,
            start_date: self.start_date,
            expires_at: self.expires_at(duration),
            is_active: self.is_active,
            generations_used: self.generations_used,
            max_generations: self.max_generations,
        }
    }
}

/// Client-facing projection of a trial, cached on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialSnapshot {
    pub trial_id: TrialId,
    pub trial_type: TrialType,
    pub start_date: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub generations_used: u32,
    pub max_generations: u32,
}

impl TrialSnapshot {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    #[must_use]
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        days_until(self.expires_at, now)
    }

    #[must_use]
    pub fn generations_exhausted(&self) -> bool {
        self.max_generations > 0 && self.generations_used >= self.max_generations
    }

    /// Remaining generations, or `None` when uncapped.
    #[must_use]
    pub fn generations_remaining(&self) -> Option<u32> {
        (self.max_generations > 0)
            .then(|| self.max_generations.saturating_sub(self.generations_used))
    }
}

fn days_until(end: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let secs = (end - now).num_seconds();
    if secs <= 0 {
        0
    } else {
        (secs + 86_399) / 86_400
    }
}

/// Result of validateTrial / startTrial / recordGeneration.
///
/// Negative outcomes (not found, expired, duplicate, abuse) are carried here
/// with a reason rather than as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialValidationResult {
    pub is_valid: bool,
    pub is_active: bool,
    pub days_remaining: i64,
    pub server_validated: bool,
    pub abuse_detected: bool,
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial: Option<TrialSnapshot>,
}

impl TrialValidationResult {
    /// A valid, active trial.
    #[must_use]
    pub fn granted(trial: TrialSnapshot, days_remaining: i64) -> Self {
        Self {
            is_valid: true,
            is_active: true,
            days_remaining,
            server_validated: true,
            abuse_detected: false,
            reason: None,
            trial: Some(trial),
        }
    }

    /// A negative result with no trial attached.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            is_active: false,
            days_remaining: 0,
            server_validated: true,
            abuse_detected: false,
            reason: Some(reason.into()),
            trial: None,
        }
    }

    /// A negative result flagged as abuse.
    #[must_use]
    pub fn abuse(reason: impl Into<String>) -> Self {
        Self {
            abuse_detected: true,
            ..Self::rejected(reason)
        }
    }

    /// A trial that exists but is past its end date.
    #[must_use]
    pub fn expired(mut trial: TrialSnapshot) -> Self {
        trial.is_active = false;
        Self {
            trial: Some(trial),
            ..Self::rejected(reasons::TRIAL_EXPIRED)
        }
    }

    /// An active trial that has no generations left.
    #[must_use]
    pub fn exhausted(trial: TrialSnapshot, days_remaining: i64) -> Self {
        let reason = usage_summary(trial.generations_used, trial.max_generations);
        Self {
            is_valid: false,
            is_active: true,
            days_remaining,
            server_validated: true,
            abuse_detected: false,
            reason: Some(reason),
            trial: Some(trial),
        }
    }
}

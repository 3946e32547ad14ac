//! Abuse evaluation results and the pattern tags that feed them.

use serde::{Deserialize, Serialize};

/// Suspicious patterns recognised by the scoring engine, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbusePattern {
    MultipleTrialsSameFingerprint,
    MultipleTrialsSameUser,
    SimulatorDevice,
    RapidTrialCreation,
    UnusualHours,
    InvalidFingerprint,
}

impl AbusePattern {
    /// All patterns in evaluation order.
    pub const ALL: [AbusePattern; 6] = [
        Self::MultipleTrialsSameFingerprint,
        Self::MultipleTrialsSameUser,
        Self::SimulatorDevice,
        Self::RapidTrialCreation,
        Self::UnusualHours,
        Self::InvalidFingerprint,
    ];

    /// Stable tag used in responses, logs, and reports.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::MultipleTrialsSameFingerprint => "multiple_trials_same_fingerprint",
            Self::MultipleTrialsSameUser => "multiple_trials_same_user",
            Self::SimulatorDevice => "simulator_device",
            Self::RapidTrialCreation => "rapid_trial_creation",
            Self::UnusualHours => "unusual_hours",
            Self::InvalidFingerprint => "invalid_fingerprint",
        }
    }

    /// Weight in hundredths (0.4 is 40).
    #[must_use]
    pub fn weight_hundredths(&self) -> u32 {
        match self {
            Self::MultipleTrialsSameFingerprint => 40,
            Self::MultipleTrialsSameUser => 30,
            Self::SimulatorDevice => 20,
            Self::RapidTrialCreation => 30,
            Self::UnusualHours => 10,
            Self::InvalidFingerprint => 50,
        }
    }
}

/// Result of an abuse evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbuseResult {
    pub is_abuse: bool,
    pub reason: Option<String>,
    /// Weighted sum of triggered patterns, clamped to [0, 1] for reporting.
    pub confidence: f64,
    /// Triggered pattern tags in evaluation order.
    pub detected_patterns: Vec<String>,
}

//! Abuse scoring for trial requests.
//!
//! The engine is a pure function of the request signals and a snapshot of
//! registry history. It performs no I/O and holds no mutable state, so any
//! number of evaluations may run in parallel.
//!
//! # Rule table
//!
//! | Pattern | Weight |
//! |---|---|
//! | more than one trial sharing the fingerprint | 0.4 |
//! | more than one trial for the user | 0.3 |
//! | simulator or emulator device | 0.2 |
//! | a trial for the user created in the last 24h | 0.3 |
//! | request outside 06:00–22:00 server time | 0.1 |
//! | fingerprint shorter than 32 chars or a placeholder | 0.5 |
//!
//! Weights add up without a ceiling. A request is abusive when the sum is
//! strictly greater than 0.5. Weights are kept in hundredths so that
//! boundary is exact.

use chrono::{DateTime, Duration, FixedOffset, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use vivid_types::{AbusePattern, AbuseResult, DeviceInfo};

/// Decision threshold in hundredths; the score must exceed it.
pub const ABUSE_THRESHOLD: u32 = 50;

/// Minimum fingerprint length accepted without penalty.
pub const MIN_FINGERPRINT_LEN: usize = 32;

/// Fingerprints that clients send when they could not compute a real one.
pub const PLACEHOLDER_FINGERPRINTS: &[&str] = &[
    "test",
    "unknown",
    "default",
    "null",
    "none",
    "simulator",
    "00000000-0000-0000-0000-000000000000",
];

/// Registry history relevant to one request.
///
/// Counts are of existing records. The request being evaluated would add one
/// more, so "more than one trial" triggers as soon as one already exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbuseHistory {
    /// Trial records (active or not) carrying the request's fingerprint.
    pub trials_with_fingerprint: u32,
    /// Trial records (active or not) for the requesting user.
    pub trials_for_user: u32,
    /// Creation time of the user's most recent trial.
    pub last_user_trial_created_at: Option<DateTime<Utc>>,
}

/// Signals carried by the request itself.
#[derive(Debug, Clone, Copy)]
pub struct AbuseSignals<'a> {
    pub user_id: &'a str,
    pub fingerprint: &'a str,
    pub device_info: &'a DeviceInfo,
    /// Server-assigned request time.
    pub request_time: DateTime<Utc>,
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbuseEngineConfig {
    /// Offset of the server's local time, used for the night-time rule.
    pub server_offset: FixedOffset,
    /// First local hour considered normal (inclusive).
    pub active_from_hour: u32,
    /// First local hour considered unusual again (exclusive end of the window).
    pub active_until_hour: u32,
    /// Window for the rapid-creation rule.
    pub rapid_window: Duration,
}

impl Default for AbuseEngineConfig {
    fn default() -> Self {
        Self {
            server_offset: Utc.fix(),
            active_from_hour: 6,
            active_until_hour: 22,
            rapid_window: Duration::hours(24),
        }
    }
}

/// Outcome of one evaluation, before it is shaped into an [`AbuseResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbuseEvaluation {
    /// Triggered patterns in rule-table order.
    pub patterns: Vec<AbusePattern>,
    /// Unclamped sum of weights in hundredths.
    pub score: u32,
}

impl AbuseEvaluation {
    /// Unclamped confidence (may exceed 1.0).
    #[must_use]
    pub fn raw_confidence(&self) -> f64 {
        f64::from(self.score) / 100.0
    }

    /// Confidence clamped to [0, 1] for reporting.
    #[must_use]
    pub fn confidence(&self) -> f64 {
        self.raw_confidence().min(1.0)
    }

    #[must_use]
    pub fn is_abuse(&self) -> bool {
        self.score > ABUSE_THRESHOLD
    }

    /// Pattern tags in rule-table order.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        self.patterns.iter().map(|p| p.tag().to_string()).collect()
    }

    /// Shapes the evaluation into the API result.
    #[must_use]
    pub fn to_result(&self) -> AbuseResult {
        let reason = self
            .is_abuse()
            .then(|| format!("Suspicious activity detected: {}", self.tags().join(", ")));
        AbuseResult {
            is_abuse: self.is_abuse(),
            reason,
            confidence: self.confidence(),
            detected_patterns: self.tags(),
        }
    }
}

/// The weighted rule evaluator.
#[derive(Debug, Clone, Default)]
pub struct AbuseEngine {
    config: AbuseEngineConfig,
}

impl AbuseEngine {
    #[must_use]
    pub fn new(config: AbuseEngineConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &AbuseEngineConfig {
        &self.config
    }

    /// Scores a request against the rule table.
    #[must_use]
    pub fn evaluate(&self, signals: &AbuseSignals<'_>, history: &AbuseHistory) -> AbuseEvaluation {
        let mut patterns = Vec::new();

        if history.trials_with_fingerprint >= 1 {
            patterns.push(AbusePattern::MultipleTrialsSameFingerprint);
        }
        if history.trials_for_user >= 1 {
            patterns.push(AbusePattern::MultipleTrialsSameUser);
        }
        if signals.device_info.indicates_simulator() {
            patterns.push(AbusePattern::SimulatorDevice);
        }
        if let Some(created) = history.last_user_trial_created_at {
            if signals.request_time - created < self.config.rapid_window {
                patterns.push(AbusePattern::RapidTrialCreation);
            }
        }
        if self.is_unusual_hour(signals.request_time) {
            patterns.push(AbusePattern::UnusualHours);
        }
        if is_invalid_fingerprint(signals.fingerprint) {
            patterns.push(AbusePattern::InvalidFingerprint);
        }

        let score = patterns.iter().map(AbusePattern::weight_hundredths).sum();
        let evaluation = AbuseEvaluation { patterns, score };

        debug!(
            user_id = signals.user_id,
            score = evaluation.score,
            patterns = ?evaluation.tags(),
            "abuse rules evaluated"
        );
        evaluation
    }

    fn is_unusual_hour(&self, at: DateTime<Utc>) -> bool {
        let hour = at.with_timezone(&self.config.server_offset).hour();
        hour < self.config.active_from_hour || hour >= self.config.active_until_hour
    }
}

/// True for fingerprints too short to be real or known placeholder values.
#[must_use]
pub fn is_invalid_fingerprint(fingerprint: &str) -> bool {
    let trimmed = fingerprint.trim();
    trimmed.chars().count() < MIN_FINGERPRINT_LEN
        || PLACEHOLDER_FINGERPRINTS
            .iter()
            .any(|p| trimmed.eq_ignore_ascii_case(p))
}

//! Core type definitions for Vivid entitlements.
//!
//! This crate defines the types shared by the device-side validation client
//! and the server-side registry:
//! - Trial identifiers (UUID v7)
//! - Trial and referral records, plus their wire projections
//! - Abuse evaluation results and pattern tags
//! - The request/response bodies of the entitlement API
//! - A `Clock` abstraction so time-based rules can be driven in tests

mod abuse;
mod clock;
mod device;
mod ids;
mod referral;
mod trial;
pub mod wire;

pub use abuse::{AbusePattern, AbuseResult};
pub use clock::{Clock, ManualClock, SystemClock};
pub use device::DeviceInfo;
pub use ids::TrialId;
pub use referral::{ReferralCodeResponse, ReferralRecord, ReferralResult};
pub use trial::{
    reasons, usage_summary, TrialPolicy, TrialRecord, TrialSnapshot, TrialType,
    TrialValidationResult,
};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid trial id {0}")]
    InvalidTrialId(String),

    #[error("invalid trial type: {0}")]
    InvalidTrialType(String),
}

//! Device-side entitlement validation.
//!
//! This crate handles:
//! - Device identity: installation id plus a hardware-derived fingerprint
//! - An encrypted, authenticated on-device cache of the last confirmed
//!   trial/referral state
//! - The validation client: credentials, retry with backoff, offline
//!   fallback, and change events
//!
//! # Trust model
//!
//! The server is authoritative. The cache only answers the local "may I
//! generate now?" question between syncs, and it fails closed: a cache that
//! does not decrypt, belongs to another user, or could not be re-validated
//! allows nothing.

mod api;
mod client;
mod device;
mod error;
mod store;

pub use api::{
    CredentialProvider, Credentials, EntitlementApi, HttpEntitlementApi, Session,
    StaticCredentials,
};
pub use client::{
    ClientConfig, EntitlementEvent, GenerationAllowance, GenerationDecision, RetryPolicy,
    TrialOutcome, ValidationClient,
};
pub use device::{DeviceIdentity, DeviceIdentityProvider, DeviceSignals, SIMULATOR_ENV_VARS};
pub use error::{ClientError, ClientResult};
pub use store::{EntitlementCache, LocalEntitlementStore, CACHE_FILE_NAME};

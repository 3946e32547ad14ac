//! Entitlement server for Vivid.
//!
//! Exposes the trial, abuse and referral API over HTTP, backed by the
//! registry, and runs the reconciliation jobs (expiry sweep and weekly abuse
//! report) alongside it.

pub mod auth;
pub mod config;
mod error;
mod handlers;
pub mod scheduler;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use vivid_abuse::AbuseEngine;
use vivid_registry::Registry;
use vivid_types::wire::{
    CREATE_REFERRAL_PATH, DETECT_ABUSE_PATH, HEALTH_PATH, RECORD_GENERATION_PATH,
    REDEEM_REFERRAL_PATH, START_TRIAL_PATH, VALIDATE_TRIAL_PATH,
};
use vivid_types::Clock;

pub use auth::{Authenticated, Caller, TokenError, TokenVerifier};
pub use config::{Args, ConfigError, ServerConfig};
pub use error::{ApiError, ApiResult};
pub use handlers::HealthResponse;
pub use scheduler::{Scheduler, ScheduleConfig, SweepReport};

/// Shared state handed to every request handler.
pub struct AppState {
    pub registry: Arc<Registry>,
    pub engine: AbuseEngine,
    pub verifier: TokenVerifier,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        engine: AbuseEngine,
        verifier: TokenVerifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            engine,
            verifier,
            clock,
        }
    }
}

/// Build the HTTP API router with the given state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(handlers::health))
        .route(VALIDATE_TRIAL_PATH, post(handlers::validate_trial))
        .route(START_TRIAL_PATH, post(handlers::start_trial))
        .route(RECORD_GENERATION_PATH, post(handlers::record_generation))
        .route(DETECT_ABUSE_PATH, post(handlers::detect_abuse))
        .route(CREATE_REFERRAL_PATH, post(handlers::create_referral))
        .route(REDEEM_REFERRAL_PATH, post(handlers::redeem_referral))
        .with_state(state)
}

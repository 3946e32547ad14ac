//! Request handlers.
//!
//! Every entitlement route authenticates first and only then touches the
//! registry. Registry calls are blocking and run on the blocking pool, with
//! a bounded retry when SQLite reports busy or locked.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use vivid_abuse::{AbuseEvaluation, AbuseSignals};
use vivid_registry::{
    AbuseEvent, CreateOutcome, GenerationOutcome, RedemptionOutcome, Registry, RegistryResult,
};
use vivid_types::wire::{
    CreateReferralRequest, DetectAbuseRequest, RecordGenerationRequest, RedeemReferralRequest,
    StartTrialRequest, ValidateTrialRequest,
};
use vivid_types::{
    reasons, AbuseResult, DeviceInfo, ReferralCodeResponse, ReferralResult, TrialId, TrialRecord,
    TrialValidationResult,
};

use crate::auth::Authenticated;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

const REGISTRY_ATTEMPTS: u32 = 3;
const REGISTRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ── Trials ───────────────────────────────────────────────────────

pub(crate) async fn validate_trial(
    State(state): State<Arc<AppState>>,
    auth: Authenticated,
    body: Result<Json<ValidateTrialRequest>, JsonRejection>,
) -> ApiResult<Json<TrialValidationResult>> {
    let Json(req) = body?;
    let now = state.clock.now();
    auth.for_user(&req.user_id)?;

    let Some(trial_id) = parse_trial_id(&req.trial_id) else {
        return Ok(Json(TrialValidationResult::rejected(reasons::TRIAL_NOT_FOUND)));
    };
    let Some(record) = with_registry(&state, "get_trial", move |r| r.get_trial(&trial_id)).await?
    else {
        return Ok(Json(TrialValidationResult::rejected(reasons::TRIAL_NOT_FOUND)));
    };
    if record.user_id != req.user_id {
        return Ok(Json(TrialValidationResult::rejected(reasons::NOT_OWNER)));
    }

    let duration = state.registry.policy().duration();
    if let Some(claimed) = req.is_active {
        if claimed != record.is_active {
            debug!(trial_id = %trial_id, claimed, stored = record.is_active, "client trial state disagrees");
        }
    }
    if let Some(claimed) = req.start_date {
        if claimed != record.start_date {
            debug!(trial_id = %trial_id, "client start date ignored");
        }
    }

    if !record.is_active || record.is_expired_at(duration, now) {
        if record.is_active {
            spawn_deactivation(&state, trial_id, now);
        }
        return Ok(Json(TrialValidationResult::expired(record.snapshot(duration))));
    }

    Ok(Json(TrialValidationResult::granted(
        record.snapshot(duration),
        record.days_remaining(duration, now),
    )))
}

pub(crate) async fn start_trial(
    State(state): State<Arc<AppState>>,
    auth: Authenticated,
    body: Result<Json<StartTrialRequest>, JsonRejection>,
) -> ApiResult<Json<TrialValidationResult>> {
    let Json(req) = body?;
    let now = state.clock.now();
    let caller = auth.for_user(&req.user_id)?;
    if !req.device_id.is_empty() && req.device_id != caller.device_id {
        debug!(
            reported = %req.device_id,
            attested = %caller.device_id,
            "device id differs from attestation"
        );
    }

    let user_id = req.user_id.clone();
    let existing =
        with_registry(&state, "active_trial_for_user", move |r| r.active_trial_for_user(&user_id))
            .await?;
    if let Some(active) = existing {
        info!(user_id = %req.user_id, trial_id = %active.trial_id, "trial start refused: already active");
        return Ok(Json(TrialValidationResult::abuse(reasons::ALREADY_ACTIVE)));
    }

    let evaluation =
        evaluate_abuse(&state, &req.user_id, &req.device_fingerprint, &req.device_info, now)
            .await?;
    if evaluation.is_abuse() {
        let result = evaluation.to_result();
        return Ok(Json(TrialValidationResult::abuse(
            result.reason.unwrap_or_else(|| "Suspicious activity detected".to_string()),
        )));
    }

    let policy = state.registry.policy().clone();
    let record = TrialRecord::new(
        req.user_id.clone(),
        caller.device_id,
        req.device_fingerprint.clone(),
        req.trial_type,
        &policy,
        now,
    );
    let outcome = with_registry(&state, "create_trial", move |r| {
        r.create_trial_if_none_active(record.clone())
    })
    .await?;

    match outcome {
        CreateOutcome::Created(record) => {
            info!(
                user_id = %record.user_id,
                trial_id = %record.trial_id,
                trial_type = %record.trial_type,
                "trial started"
            );
            Ok(Json(TrialValidationResult::granted(
                record.snapshot(policy.duration()),
                policy.duration_days,
            )))
        }
        CreateOutcome::AlreadyActive(existing) => {
            info!(user_id = %existing.user_id, "trial start lost a race to a concurrent start");
            Ok(Json(TrialValidationResult::abuse(reasons::ALREADY_ACTIVE)))
        }
    }
}

pub(crate) async fn record_generation(
    State(state): State<Arc<AppState>>,
    auth: Authenticated,
    body: Result<Json<RecordGenerationRequest>, JsonRejection>,
) -> ApiResult<Json<TrialValidationResult>> {
    let Json(req) = body?;
    let now = state.clock.now();
    auth.for_user(&req.user_id)?;

    let Some(trial_id) = parse_trial_id(&req.trial_id) else {
        return Ok(Json(TrialValidationResult::rejected(reasons::TRIAL_NOT_FOUND)));
    };
    let user_id = req.user_id.clone();
    let outcome = with_registry(&state, "record_generation", move |r| {
        r.record_generation(&trial_id, &user_id, now)
    })
    .await?;

    let duration = state.registry.policy().duration();
    let result = match outcome {
        GenerationOutcome::Recorded(record) => TrialValidationResult::granted(
            record.snapshot(duration),
            record.days_remaining(duration, now),
        ),
        GenerationOutcome::NotFound => TrialValidationResult::rejected(reasons::TRIAL_NOT_FOUND),
        GenerationOutcome::NotOwner => TrialValidationResult::rejected(reasons::NOT_OWNER),
        GenerationOutcome::Expired(record) => {
            if record.is_active {
                spawn_deactivation(&state, trial_id, now);
            }
            TrialValidationResult::expired(record.snapshot(duration))
        }
        GenerationOutcome::Exhausted(record) => {
            debug!(trial_id = %trial_id, used = record.generations_used, "generation cap reached");
            TrialValidationResult::exhausted(
                record.snapshot(duration),
                record.days_remaining(duration, now),
            )
        }
    };
    Ok(Json(result))
}

/// Trial ids are opaque to callers; one this server could not have issued
/// is simply not found.
fn parse_trial_id(raw: &str) -> Option<TrialId> {
    match TrialId::parse(raw) {
        Ok(trial_id) => Some(trial_id),
        Err(e) => {
            debug!(error = %e, "unknown trial id format");
            None
        }
    }
}

// ── Abuse ────────────────────────────────────────────────────────

pub(crate) async fn detect_abuse(
    State(state): State<Arc<AppState>>,
    auth: Authenticated,
    body: Result<Json<DetectAbuseRequest>, JsonRejection>,
) -> ApiResult<Json<AbuseResult>> {
    let Json(req) = body?;
    let now = state.clock.now();
    auth.for_user(&req.user_id)?;

    let evaluation =
        evaluate_abuse(&state, &req.user_id, &req.device_fingerprint, &req.device_info, now)
            .await?;
    Ok(Json(evaluation.to_result()))
}

/// Scores a request against registry history and appends it to the abuse log.
async fn evaluate_abuse(
    state: &AppState,
    user_id: &str,
    fingerprint: &str,
    device_info: &DeviceInfo,
    now: DateTime<Utc>,
) -> ApiResult<AbuseEvaluation> {
    let (user, fp) = (user_id.to_string(), fingerprint.to_string());
    let history =
        with_registry(state, "abuse_history", move |r| r.abuse_history(&user, &fp)).await?;

    let signals = AbuseSignals {
        user_id,
        fingerprint,
        device_info,
        request_time: now,
    };
    let evaluation = state.engine.evaluate(&signals, &history);

    if evaluation.is_abuse() {
        warn!(
            user_id,
            confidence = evaluation.confidence(),
            patterns = ?evaluation.tags(),
            "abuse detected"
        );
    } else {
        debug!(
            user_id,
            confidence = evaluation.confidence(),
            patterns = ?evaluation.tags(),
            "abuse check passed"
        );
    }

    let event = AbuseEvent {
        user_id: user_id.to_string(),
        device_fingerprint: fingerprint.to_string(),
        confidence: evaluation.confidence(),
        is_abuse: evaluation.is_abuse(),
        patterns: evaluation.tags(),
        created_at: now,
    };
    if let Err(e) = with_registry(state, "log_abuse_event", move |r| r.log_abuse_event(&event)).await
    {
        warn!(user_id, error = %e, "failed to log abuse event");
    }

    Ok(evaluation)
}

// ── Referrals ────────────────────────────────────────────────────

pub(crate) async fn create_referral(
    State(state): State<Arc<AppState>>,
    auth: Authenticated,
    body: Result<Json<CreateReferralRequest>, JsonRejection>,
) -> ApiResult<Json<ReferralCodeResponse>> {
    let Json(req) = body?;
    let now = state.clock.now();
    auth.for_user(&req.user_id)?;

    let (user, fp) = (req.user_id.clone(), req.device_fingerprint.clone());
    let record = with_registry(&state, "get_or_create_referral", move |r| {
        r.get_or_create_referral(&user, &fp, now)
    })
    .await?;

    Ok(Json(ReferralCodeResponse {
        referral_code: record.referral_code,
        rewards_granted: record.rewards_granted,
    }))
}

pub(crate) async fn redeem_referral(
    State(state): State<Arc<AppState>>,
    auth: Authenticated,
    body: Result<Json<RedeemReferralRequest>, JsonRejection>,
) -> ApiResult<Json<ReferralResult>> {
    let Json(req) = body?;
    let now = state.clock.now();
    auth.for_user(&req.user_id)?;

    let (code, user, fp) = (
        req.referral_code.clone(),
        req.user_id.clone(),
        req.device_fingerprint.clone(),
    );
    let outcome = with_registry(&state, "redeem_referral", move |r| {
        r.redeem_referral(&code, &user, &fp, now)
    })
    .await?;

    let result = match outcome {
        RedemptionOutcome::Redeemed {
            referrer_id,
            rewards_total,
        } => {
            info!(referee = %req.user_id, referrer = %referrer_id, rewards_total, "referral redeemed");
            ReferralResult::redeemed(rewards_total)
        }
        RedemptionOutcome::Rejected(reason) => {
            debug!(referee = %req.user_id, reason, "referral redemption refused");
            ReferralResult::rejected(reason)
        }
    };
    Ok(Json(result))
}

// ── Registry access ──────────────────────────────────────────────

/// Runs a registry operation on the blocking pool, retrying busy/locked
/// errors a bounded number of times.
async fn with_registry<T, F>(state: &AppState, op: &'static str, f: F) -> ApiResult<T>
where
    F: Fn(&Registry) -> RegistryResult<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    let f = Arc::new(f);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let registry = Arc::clone(&state.registry);
        let task = Arc::clone(&f);
        match tokio::task::spawn_blocking(move || task(&registry)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.is_transient() && attempt < REGISTRY_ATTEMPTS => {
                warn!(op, attempt, error = %e, "registry busy, retrying");
                tokio::time::sleep(REGISTRY_BACKOFF * attempt).await;
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(e) => {
                error!(op, error = %e, "registry task failed");
                return Err(ApiError::Internal("registry task failed".to_string()));
            }
        }
    }
}

/// Marks an expired trial inactive in the background. Failures only log; the
/// nightly sweep catches anything missed here.
fn spawn_deactivation(state: &AppState, trial_id: TrialId, now: DateTime<Utc>) {
    let registry = Arc::clone(&state.registry);
    tokio::task::spawn_blocking(move || match registry.deactivate_trial(&trial_id, now) {
        Ok(true) => info!(trial_id = %trial_id, "expired trial deactivated"),
        Ok(false) => {}
        Err(e) => warn!(trial_id = %trial_id, error = %e, "deactivation failed"),
    });
}

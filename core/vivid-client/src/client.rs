//! The validation client.
//!
//! Wraps the server API with credentials, bounded retry, the encrypted
//! cache, and change notifications. All cache access goes through one async
//! mutex that is never held across a network call. Each request captures the
//! session epoch when it starts; if the user signs out before the response
//! arrives, the response is dropped instead of being written to the cache.

use crate::api::{CredentialProvider, Credentials, EntitlementApi};
use crate::device::DeviceIdentityProvider;
use crate::error::{ClientError, ClientResult};
use crate::store::{EntitlementCache, LocalEntitlementStore};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use vivid_types::wire::{
    CreateReferralRequest, DetectAbuseRequest, RecordGenerationRequest, RedeemReferralRequest,
    StartTrialRequest, ValidateTrialRequest,
};
use vivid_types::{
    reasons, usage_summary, AbuseResult, Clock, ReferralCodeResponse, ReferralResult, TrialId,
    TrialSnapshot, TrialType, TrialValidationResult,
};

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub retry: RetryPolicy,
    /// Capacity of the event channel; slow subscribers miss old events.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            event_capacity: 16,
        }
    }
}

/// Change notifications for UI layers.
#[derive(Debug, Clone, PartialEq)]
pub enum EntitlementEvent {
    /// The server confirmed a new trial projection (or the absence of one).
    TrialUpdated(Option<TrialSnapshot>),
    /// The server could not be reached; the cache is now unverified.
    Unverified,
    /// The server refused a trial as abusive.
    AbuseDetected(String),
    ReferralUpdated(ReferralCodeResponse),
    SignedOut,
}

/// Result of a trial operation.
#[derive(Debug, Clone, PartialEq)]
pub enum TrialOutcome {
    /// The server answered.
    Verified(TrialValidationResult),
    /// The server could not be reached; carries the last-known projection.
    Unverified {
        cached: Option<TrialSnapshot>,
        error: String,
    },
}

impl TrialOutcome {
    #[must_use]
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified(_))
    }

    /// The server result, if there was one.
    #[must_use]
    pub fn result(&self) -> Option<&TrialValidationResult> {
        match self {
            Self::Verified(result) => Some(result),
            Self::Unverified { .. } => None,
        }
    }
}

/// Local answer to "may the user generate now?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationAllowance {
    /// `remaining` is `None` for uncapped trials.
    Allowed { remaining: Option<u32> },
    Denied { reason: String },
}

impl GenerationAllowance {
    fn denied(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Result of [`ValidationClient::record_generation`].
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationDecision {
    /// The server counted the generation.
    Recorded(TrialValidationResult),
    Denied { reason: String },
}

/// Device-side entitlement client.
pub struct ValidationClient {
    api: Arc<dyn EntitlementApi>,
    credentials: Arc<dyn CredentialProvider>,
    device: DeviceIdentityProvider,
    store: Arc<LocalEntitlementStore>,
    clock: Arc<dyn Clock>,
    config: ClientConfig,
    cache: Mutex<Option<EntitlementCache>>,
    epoch: AtomicU64,
    events: broadcast::Sender<EntitlementEvent>,
}

impl ValidationClient {
    /// Creates a client, loading whatever cache is on disk.
    pub fn new(
        api: Arc<dyn EntitlementApi>,
        credentials: Arc<dyn CredentialProvider>,
        device: DeviceIdentityProvider,
        store: LocalEntitlementStore,
        clock: Arc<dyn Clock>,
        config: ClientConfig,
    ) -> Self {
        let cached = store.load();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            api,
            credentials,
            device,
            store: Arc::new(store),
            clock,
            config,
            cache: Mutex::new(cached),
            epoch: AtomicU64::new(0),
            events,
        }
    }

    /// Subscribes to entitlement change events.
    pub fn subscribe(&self) -> broadcast::Receiver<EntitlementEvent> {
        self.events.subscribe()
    }

    /// The cached projection for the signed-in user.
    pub async fn cached(&self) -> Option<EntitlementCache> {
        let user_id = self.credentials.session().map(|s| s.user_id)?;
        let cache = self.cache.lock().await;
        cache.as_ref().filter(|c| c.user_id == user_id).cloned()
    }

    // ── Trials ───────────────────────────────────────────────────

    /// Asks the server whether a trial is still valid.
    pub async fn validate_trial(&self, trial_id: TrialId) -> ClientResult<TrialOutcome> {
        let (credentials, user_id, epoch) = self.prepare()?;
        let cached = self.cached_trial(&user_id).await;
        let request = ValidateTrialRequest {
            device_id: self.device.device_id(),
            trial_id: trial_id.to_string(),
            start_date: cached.as_ref().map(|t| t.start_date),
            is_active: cached.as_ref().map(|t| t.is_active),
            device_fingerprint: self.device.current_fingerprint(),
            user_id: user_id.clone(),
        };

        let response = self
            .with_retry("validate_trial", || {
                self.api.validate_trial(&credentials, &request)
            })
            .await;
        self.apply_trial_response(response, &user_id, epoch, false)
            .await
    }

    /// Re-validates the cached trial, if there is one.
    pub async fn revalidate(&self) -> ClientResult<Option<TrialOutcome>> {
        let user_id = self.session_user()?;
        match self.cached_trial(&user_id).await {
            Some(trial) => self.validate_trial(trial.trial_id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Asks the server to start a trial for the signed-in user.
    pub async fn start_trial(&self, trial_type: TrialType) -> ClientResult<TrialOutcome> {
        let (credentials, user_id, epoch) = self.prepare()?;
        let request = StartTrialRequest {
            trial_type,
            device_fingerprint: self.device.current_fingerprint(),
            user_id: user_id.clone(),
            device_id: self.device.device_id(),
            device_info: self.device.device_info(),
        };

        let response = self
            .with_retry("start_trial", || self.api.start_trial(&credentials, &request))
            .await;
        self.apply_trial_response(response, &user_id, epoch, true)
            .await
    }

    /// Read-only abuse evaluation for this device and user.
    pub async fn detect_abuse(&self) -> ClientResult<AbuseResult> {
        let (credentials, user_id, _) = self.prepare()?;
        let request = DetectAbuseRequest {
            user_id,
            device_fingerprint: self.device.current_fingerprint(),
            device_info: self.device.device_info(),
        };
        self.with_retry("detect_abuse", || self.api.detect_abuse(&credentials, &request))
            .await
    }

    // ── Generations ──────────────────────────────────────────────

    /// Decides from the cache alone whether a generation may be attempted.
    pub async fn check_generation_allowance(&self) -> GenerationAllowance {
        let Some(user_id) = self.credentials.session().map(|s| s.user_id) else {
            return GenerationAllowance::denied(reasons::VALIDATION_REQUIRED);
        };
        let cache = self.cache.lock().await;
        let Some(cache) = cache.as_ref().filter(|c| c.user_id == user_id) else {
            return GenerationAllowance::denied(reasons::VALIDATION_REQUIRED);
        };
        let Some(trial) = &cache.trial else {
            return GenerationAllowance::denied(reasons::VALIDATION_REQUIRED);
        };
        if !cache.verified {
            return GenerationAllowance::denied(reasons::REVALIDATION_REQUIRED);
        }
        if !trial.is_active || trial.is_expired_at(self.clock.now()) {
            return GenerationAllowance::denied(reasons::TRIAL_EXPIRED);
        }
        if trial.generations_exhausted() {
            return GenerationAllowance::denied(usage_summary(
                trial.generations_used,
                trial.max_generations,
            ));
        }
        GenerationAllowance::Allowed {
            remaining: trial.generations_remaining(),
        }
    }

    /// Records one generation: local check first, then the server.
    ///
    /// A local denial makes no network call. If the server cannot be reached
    /// the generation is denied and the cache is marked unverified.
    pub async fn record_generation(&self) -> ClientResult<GenerationDecision> {
        if let GenerationAllowance::Denied { reason } = self.check_generation_allowance().await {
            debug!(%reason, "generation denied locally");
            return Ok(GenerationDecision::Denied { reason });
        }

        let (credentials, user_id, epoch) = self.prepare()?;
        let Some(trial) = self.cached_trial(&user_id).await else {
            return Ok(GenerationDecision::Denied {
                reason: reasons::VALIDATION_REQUIRED.to_string(),
            });
        };
        let request = RecordGenerationRequest {
            trial_id: trial.trial_id.to_string(),
            user_id: user_id.clone(),
        };

        let response = self
            .with_retry("record_generation", || {
                self.api.record_generation(&credentials, &request)
            })
            .await;
        match self
            .apply_trial_response(response, &user_id, epoch, false)
            .await?
        {
            TrialOutcome::Verified(result) if result.is_valid => {
                Ok(GenerationDecision::Recorded(result))
            }
            TrialOutcome::Verified(result) => Ok(GenerationDecision::Denied {
                reason: result
                    .reason
                    .unwrap_or_else(|| reasons::VALIDATION_REQUIRED.to_string()),
            }),
            TrialOutcome::Unverified { .. } => Ok(GenerationDecision::Denied {
                reason: reasons::REVALIDATION_REQUIRED.to_string(),
            }),
        }
    }

    // ── Referrals ────────────────────────────────────────────────

    /// Fetches (or issues) the user's referral code.
    pub async fn create_referral(&self) -> ClientResult<ReferralCodeResponse> {
        let (credentials, user_id, epoch) = self.prepare()?;
        let request = CreateReferralRequest {
            user_id: user_id.clone(),
            device_fingerprint: self.device.current_fingerprint(),
        };
        let response = self
            .with_retry("create_referral", || {
                self.api.create_referral(&credentials, &request)
            })
            .await?;

        let referral = response.clone();
        self.update_cache(epoch, &user_id, move |cache| {
            cache.referral = Some(referral);
        })
        .await?;
        self.emit(EntitlementEvent::ReferralUpdated(response.clone()));
        Ok(response)
    }

    /// Redeems someone else's referral code.
    pub async fn redeem_referral(&self, code: &str) -> ClientResult<ReferralResult> {
        let (credentials, user_id, epoch) = self.prepare()?;
        let request = RedeemReferralRequest {
            referral_code: code.to_string(),
            user_id,
            device_fingerprint: self.device.current_fingerprint(),
        };
        let result = self
            .with_retry("redeem_referral", || {
                self.api.redeem_referral(&credentials, &request)
            })
            .await?;
        self.check_epoch(epoch)?;
        Ok(result)
    }

    // ── Session ──────────────────────────────────────────────────

    /// Drops the cache and invalidates in-flight requests.
    pub async fn sign_out(&self) -> ClientResult<()> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let mut cache = self.cache.lock().await;
        *cache = None;
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.clear())
            .await
            .map_err(|e| ClientError::Storage(format!("cache clear task failed: {e}")))??;
        drop(cache);

        info!("signed out, entitlement cache cleared");
        self.emit(EntitlementEvent::SignedOut);
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────

    fn session_user(&self) -> ClientResult<String> {
        self.credentials
            .session()
            .map(|s| s.user_id)
            .ok_or_else(|| ClientError::Unauthenticated("no active session".into()))
    }

    /// Gathers credentials before any network call.
    fn prepare(&self) -> ClientResult<(Credentials, String, u64)> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let attestation = self
            .credentials
            .attestation_token()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ClientError::FailedPrecondition("app attestation unavailable".into()))?;
        let session = self
            .credentials
            .session()
            .filter(|s| !s.token.is_empty())
            .ok_or_else(|| ClientError::Unauthenticated("no active session".into()))?;

        Ok((
            Credentials {
                attestation,
                session: session.token,
            },
            session.user_id,
            epoch,
        ))
    }

    fn check_epoch(&self, epoch: u64) -> ClientResult<()> {
        if self.epoch.load(Ordering::SeqCst) == epoch {
            Ok(())
        } else {
            debug!("discarding response from a previous session");
            Err(ClientError::Cancelled)
        }
    }

    fn emit(&self, event: EntitlementEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn cached_trial(&self, user_id: &str) -> Option<TrialSnapshot> {
        let cache = self.cache.lock().await;
        cache
            .as_ref()
            .filter(|c| c.user_id == user_id)
            .and_then(|c| c.trial.clone())
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let policy = &self.config.retry;
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(policy.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout),
            };
            match result {
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(op, attempt, error = %e, ?delay, "request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Applies `update` to the user's cache and persists it, unless the
    /// session changed since `epoch`.
    async fn update_cache<F>(&self, epoch: u64, user_id: &str, update: F) -> ClientResult<()>
    where
        F: FnOnce(&mut EntitlementCache),
    {
        let mut slot = self.cache.lock().await;
        self.check_epoch(epoch)?;

        let now = self.clock.now();
        let mut cache = slot
            .as_ref()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .unwrap_or_else(|| EntitlementCache::new(user_id, now));
        update(&mut cache);

        // The in-memory projection only moves once the blob on disk has.
        let store = Arc::clone(&self.store);
        let to_save = cache.clone();
        tokio::task::spawn_blocking(move || store.save(&to_save))
            .await
            .map_err(|e| ClientError::Storage(format!("cache save task failed: {e}")))??;
        *slot = Some(cache);
        Ok(())
    }

    async fn apply_trial_response(
        &self,
        response: ClientResult<TrialValidationResult>,
        user_id: &str,
        epoch: u64,
        starting: bool,
    ) -> ClientResult<TrialOutcome> {
        match response {
            Ok(result) => {
                let now = self.clock.now();
                // A refused start leaves the existing projection alone.
                let replaces_trial = !starting || result.is_valid;
                let snapshot = result.trial.clone();
                self.update_cache(epoch, user_id, |cache| {
                    if replaces_trial {
                        cache.trial = snapshot;
                    }
                    cache.last_sync = now;
                    cache.verified = true;
                })
                .await?;

                if result.abuse_detected {
                    let reason = result.reason.clone().unwrap_or_default();
                    self.emit(EntitlementEvent::AbuseDetected(reason));
                } else if replaces_trial {
                    self.emit(EntitlementEvent::TrialUpdated(result.trial.clone()));
                }
                Ok(TrialOutcome::Verified(result))
            }
            Err(e) if e.is_offline() => {
                warn!(error = %e, "entitlement server unreachable, falling back to cache");
                self.update_cache(epoch, user_id, |cache| cache.verified = false)
                    .await?;
                self.emit(EntitlementEvent::Unverified);
                Ok(TrialOutcome::Unverified {
                    cached: self.cached_trial(user_id).await,
                    error: e.to_string(),
                })
            }
            Err(e) => {
                self.check_epoch(epoch)?;
                Err(e)
            }
        }
    }
}

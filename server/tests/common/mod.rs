//! Shared helpers for server integration tests.

#![allow(dead_code)]

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use ed25519_dalek::{Signer, SigningKey};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use vivid_abuse::AbuseEngine;
use vivid_registry::Registry;
use vivid_server::{build_router, AppState, TokenVerifier};
use vivid_types::{Clock, ManualClock, TrialPolicy};

pub const APP_ID: &str = "ai.vivid.app";

/// Attestation signing key (seed 1..=32).
pub fn attestation_key() -> SigningKey {
    let seed: [u8; 32] = std::array::from_fn(|i| i as u8 + 1);
    SigningKey::from_bytes(&seed)
}

/// Session signing key (seed 33..=64).
pub fn session_key() -> SigningKey {
    let seed: [u8; 32] = std::array::from_fn(|i| i as u8 + 33);
    SigningKey::from_bytes(&seed)
}

/// Signs a JSON payload into `base64url(payload).base64url(sig)`.
pub fn sign_token(key: &SigningKey, payload: &serde_json::Value) -> String {
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload.to_string());
    let signature = key.sign(payload_b64.as_bytes());
    format!("{payload_b64}.{}", URL_SAFE_NO_PAD.encode(signature.to_bytes()))
}

/// Attestation token valid for 30 days from `now`.
pub fn attestation_token(app_id: &str, device_id: &str, now: DateTime<Utc>) -> String {
    sign_token(
        &attestation_key(),
        &json!({
            "appId": app_id,
            "deviceId": device_id,
            "iat": now.timestamp(),
            "exp": (now + Duration::days(30)).timestamp(),
        }),
    )
}

/// Session token for `user_id` valid for 30 days from `now`.
pub fn session_token(user_id: &str, now: DateTime<Utc>) -> String {
    sign_token(
        &session_key(),
        &json!({
            "sub": user_id,
            "iat": now.timestamp(),
            "exp": (now + Duration::days(30)).timestamp(),
        }),
    )
}

/// Wednesday 2026-03-04 12:00 UTC, well inside normal hours.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap()
}

/// A well-formed 64-char fingerprint, distinct per `n`.
pub fn fingerprint(n: u32) -> String {
    format!("{n:064x}")
}

pub fn verifier() -> TokenVerifier {
    TokenVerifier::new(
        attestation_key().verifying_key(),
        session_key().verifying_key(),
        APP_ID,
    )
}

pub struct TestServer {
    pub base: String,
    pub clock: ManualClock,
    pub registry: Arc<Registry>,
    pub http: reqwest::Client,
}

impl TestServer {
    pub async fn spawn() -> Self {
        Self::spawn_with(Registry::open_in_memory(TrialPolicy::default()).unwrap()).await
    }

    /// Spin up the HTTP server on an OS-assigned port.
    pub async fn spawn_with(registry: Registry) -> Self {
        let clock = ManualClock::new(start_time());
        let registry = Arc::new(registry);
        let state = Arc::new(AppState::new(
            Arc::clone(&registry),
            AbuseEngine::default(),
            verifier(),
            Arc::new(clock.clone()),
        ));

        let app = build_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://127.0.0.1:{port}"),
            clock,
            registry,
            http: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// POSTs `body` with valid attestation and session tokens for `user_id`.
    pub async fn post<B: Serialize>(&self, path: &str, user_id: &str, body: &B) -> reqwest::Response {
        let now = self.now();
        self.http
            .post(self.url(path))
            .header("x-app-attestation", attestation_token(APP_ID, &format!("install-{user_id}"), now))
            .bearer_auth(session_token(user_id, now))
            .json(body)
            .send()
            .await
            .unwrap()
    }

    /// Like [`post`](Self::post) but decodes a 200 response body.
    pub async fn call<B: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        user_id: &str,
        body: &B,
    ) -> R {
        let resp = self.post(path, user_id, body).await;
        assert_eq!(resp.status(), 200, "unexpected status for {path}");
        resp.json().await.unwrap()
    }
}

/// Polls `check` until it returns true or roughly two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    check()
}

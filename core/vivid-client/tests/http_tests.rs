use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use vivid_client::{ClientError, Credentials, EntitlementApi, HttpEntitlementApi};
use vivid_types::wire::{RedeemReferralRequest, StartTrialRequest, ValidateTrialRequest};
use vivid_types::{DeviceInfo, TrialId, TrialType};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn credentials() -> Credentials {
    Credentials {
        attestation: "att-token".into(),
        session: "sess-token".into(),
    }
}

fn api(server: &MockServer) -> HttpEntitlementApi {
    HttpEntitlementApi::new(server.uri(), Duration::from_secs(5)).unwrap()
}

fn validate_request() -> ValidateTrialRequest {
    ValidateTrialRequest {
        device_id: "install-1".into(),
        trial_id: TrialId::new().to_string(),
        start_date: None,
        is_active: None,
        device_fingerprint: "f".repeat(64),
        user_id: "alice".into(),
    }
}

#[tokio::test]
async fn sends_tokens_and_camel_case_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/trials/start"))
        .and(header("x-app-attestation", "att-token"))
        .and(header("authorization", "Bearer sess-token"))
        .and(body_partial_json(json!({
            "trialType": "limited",
            "userId": "alice",
            "deviceInfo": { "isSimulator": false }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "isValid": true,
            "isActive": true,
            "daysRemaining": 3,
            "serverValidated": true,
            "abuseDetected": false,
            "reason": null
        })))
        .expect(1)
        .mount(&server)
        .await;

    let request = StartTrialRequest {
        trial_type: TrialType::Limited,
        device_fingerprint: "f".repeat(64),
        user_id: "alice".into(),
        device_id: "install-1".into(),
        device_info: DeviceInfo::default(),
    };
    let result = api(&server).start_trial(&credentials(), &request).await.unwrap();
    assert!(result.is_valid);
    assert_eq!(result.days_remaining, 3);
    assert_eq!(result.trial, None);
}

#[tokio::test]
async fn maps_auth_statuses_to_error_kinds() {
    let server = MockServer::start().await;
    let body = |code: &str| {
        json!({ "error": { "code": code, "message": format!("{code} rejected") } })
    };
    Mock::given(path("/api/v1/trials/validate"))
        .respond_with(ResponseTemplate::new(401).set_body_json(body("unauthenticated")))
        .mount(&server)
        .await;
    Mock::given(path("/api/v1/trials/generation"))
        .respond_with(ResponseTemplate::new(412).set_body_json(body("failed_precondition")))
        .mount(&server)
        .await;
    Mock::given(path("/api/v1/referrals/redeem"))
        .respond_with(ResponseTemplate::new(403).set_body_json(body("permission_denied")))
        .mount(&server)
        .await;

    let api = api(&server);
    let err = api.validate_trial(&credentials(), &validate_request()).await.unwrap_err();
    assert!(matches!(err, ClientError::Unauthenticated(ref m) if m == "unauthenticated rejected"));

    let err = api
        .record_generation(
            &credentials(),
            &vivid_types::wire::RecordGenerationRequest {
                trial_id: TrialId::new().to_string(),
                user_id: "alice".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::FailedPrecondition(_)));

    let err = api
        .redeem_referral(
            &credentials(),
            &RedeemReferralRequest {
                referral_code: "ABCD2345".into(),
                user_id: "bob".into(),
                device_fingerprint: "f".repeat(64),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::PermissionDenied(_)));
}

#[tokio::test]
async fn server_errors_are_retryable() {
    let server = MockServer::start().await;
    Mock::given(path("/api/v1/trials/validate"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": { "code": "internal", "message": "registry unavailable" }
        })))
        .mount(&server)
        .await;

    let err = api(&server)
        .validate_trial(&credentials(), &validate_request())
        .await
        .unwrap_err();
    match &err {
        ClientError::Server { status, code, .. } => {
            assert_eq!(*status, 500);
            assert_eq!(code, "internal");
        }
        other => panic!("expected server error, got {other:?}"),
    }
    assert!(err.is_retryable());
}

#[tokio::test]
async fn slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(path("/api/v1/trials/validate"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let api = HttpEntitlementApi::new(server.uri(), Duration::from_millis(100)).unwrap();
    let err = api
        .validate_trial(&credentials(), &validate_request())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout));
}

#[tokio::test]
async fn unreachable_server_is_a_network_error() {
    // Nothing listens on port 1.
    let api = HttpEntitlementApi::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
    let err = api
        .validate_trial(&credentials(), &validate_request())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Network(_)));
    assert!(err.is_retryable());
}

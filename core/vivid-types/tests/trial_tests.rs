use chrono::{Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use vivid_types::{
    reasons, usage_summary, DeviceInfo, TrialPolicy, TrialRecord, TrialType,
    TrialValidationResult,
};

fn start() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

fn limited_record() -> TrialRecord {
    TrialRecord::new(
        "user-1",
        "device-1",
        "f".repeat(64),
        TrialType::Limited,
        &TrialPolicy::default(),
        start(),
    )
}

// ── TrialType ────────────────────────────────────────────────────

#[test]
fn trial_type_string_roundtrip() {
    for tt in [TrialType::Limited, TrialType::Unlimited, TrialType::Freemium] {
        let parsed: TrialType = tt.as_str().parse().unwrap();
        assert_eq!(parsed, tt);
        assert_eq!(serde_json::to_string(&tt).unwrap(), format!("\"{tt}\""));
    }
}

#[test]
fn trial_type_rejects_unknown() {
    assert!("premium".parse::<TrialType>().is_err());
}

// ── TrialPolicy ──────────────────────────────────────────────────

#[test]
fn default_policy_caps() {
    let policy = TrialPolicy::default();
    assert_eq!(policy.duration(), Duration::days(3));
    assert_eq!(policy.max_generations(TrialType::Limited), 3);
    assert_eq!(policy.max_generations(TrialType::Freemium), 1);
    assert_eq!(policy.max_generations(TrialType::Unlimited), 0);
}

// ── TrialRecord ──────────────────────────────────────────────────

#[test]
fn new_record_is_active_and_validated() {
    let record = limited_record();
    assert!(record.is_active);
    assert!(record.server_validated);
    assert_eq!(record.generations_used, 0);
    assert_eq!(record.max_generations, 3);
    assert_eq!(record.created_at, record.start_date);
}

#[test]
fn expiry_is_strictly_after_end() {
    let record = limited_record();
    let duration = Duration::days(3);
    let end = start() + duration;

    assert!(!record.is_expired_at(duration, end));
    assert!(record.is_expired_at(duration, end + Duration::seconds(1)));
}

#[test]
fn days_remaining_rounds_up() {
    let record = limited_record();
    let duration = Duration::days(3);

    assert_eq!(record.days_remaining(duration, start()), 3);
    assert_eq!(record.days_remaining(duration, start() + Duration::hours(1)), 3);
    assert_eq!(record.days_remaining(duration, start() + Duration::days(2)), 1);
    assert_eq!(record.days_remaining(duration, start() + Duration::days(4)), 0);
}

#[test]
fn exhaustion_respects_cap() {
    let mut record = limited_record();
    record.generations_used = 2;
    assert!(!record.generations_exhausted());
    record.generations_used = 3;
    assert!(record.generations_exhausted());
}

#[test]
fn unlimited_is_never_exhausted() {
    let mut record = TrialRecord::new(
        "user-1",
        "device-1",
        "f".repeat(64),
        TrialType::Unlimited,
        &TrialPolicy::default(),
        start(),
    );
    record.generations_used = 10_000;
    assert!(!record.generations_exhausted());
    assert_eq!(record.snapshot(Duration::days(3)).generations_remaining(), None);
}

#[test]
fn record_serializes_camel_case() {
    let json = serde_json::to_value(limited_record()).unwrap();
    assert!(json.get("trialId").is_some());
    assert!(json.get("generationsUsed").is_some());
    assert_eq!(json["trialType"], "limited");
}

// ── TrialValidationResult ───────────────────────────────────────

#[test]
fn rejected_result_shape() {
    let result = TrialValidationResult::rejected(reasons::TRIAL_NOT_FOUND);
    assert!(!result.is_valid);
    assert!(!result.is_active);
    assert!(!result.abuse_detected);
    assert_eq!(result.reason.as_deref(), Some("Trial not found"));

    let json = serde_json::to_value(&result).unwrap();
    assert!(json.get("trial").is_none());
    assert_eq!(json["daysRemaining"], 0);
}

#[test]
fn expired_result_marks_snapshot_inactive() {
    let snapshot = limited_record().snapshot(Duration::days(3));
    let result = TrialValidationResult::expired(snapshot);
    assert_eq!(result.reason.as_deref(), Some(reasons::TRIAL_EXPIRED));
    assert!(!result.is_active);
    assert!(!result.trial.unwrap().is_active);
}

#[test]
fn exhausted_result_reports_usage() {
    let mut record = limited_record();
    record.generations_used = 3;
    let result = TrialValidationResult::exhausted(record.snapshot(Duration::days(3)), 2);
    assert!(!result.is_valid);
    assert!(result.is_active);
    assert_eq!(result.reason.as_deref(), Some("3/3 generations used"));
    assert_eq!(usage_summary(1, 3), "1/3 generations used");
}

// ── DeviceInfo ───────────────────────────────────────────────────

#[test]
fn simulator_detection() {
    let mut info = DeviceInfo {
        model: "iPhone15,2".into(),
        ..Default::default()
    };
    assert!(!info.indicates_simulator());

    info.model = "x86_64".into();
    assert!(info.indicates_simulator());

    info.model = "iPhone Simulator".into();
    assert!(info.indicates_simulator());

    let flagged = DeviceInfo {
        is_simulator: true,
        ..Default::default()
    };
    assert!(flagged.indicates_simulator());
}

#[test]
fn device_info_defaults_missing_fields() {
    let info: DeviceInfo = serde_json::from_str(r#"{"model":"Pixel 8"}"#).unwrap();
    assert_eq!(info.model, "Pixel 8");
    assert!(!info.is_simulator);
}

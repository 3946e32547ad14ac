use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use vivid_abuse::{
    is_invalid_fingerprint, AbuseEngine, AbuseEngineConfig, AbuseHistory, AbuseSignals,
    ABUSE_THRESHOLD,
};
use vivid_types::{AbusePattern, DeviceInfo};

const GOOD_FP: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

/// 14:00 UTC on a Wednesday, inside the active window.
fn daytime() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 4, 14, 0, 0).unwrap()
}

fn phone() -> DeviceInfo {
    DeviceInfo {
        model: "iPhone15,2".into(),
        system_name: "iOS".into(),
        system_version: "18.1".into(),
        app_version: "2.3.0".into(),
        is_simulator: false,
    }
}

fn evaluate(
    fingerprint: &str,
    device: &DeviceInfo,
    at: DateTime<Utc>,
    history: &AbuseHistory,
) -> vivid_abuse::AbuseEvaluation {
    let engine = AbuseEngine::default();
    let signals = AbuseSignals {
        user_id: "user-1",
        fingerprint,
        device_info: device,
        request_time: at,
    };
    engine.evaluate(&signals, history)
}

// ── Individual rules ─────────────────────────────────────────────

#[test]
fn clean_request_scores_zero() {
    let eval = evaluate(GOOD_FP, &phone(), daytime(), &AbuseHistory::default());
    assert_eq!(eval.score, 0);
    assert!(!eval.is_abuse());
    let result = eval.to_result();
    assert!(result.detected_patterns.is_empty());
    assert_eq!(result.reason, None);
}

#[test]
fn placeholder_fingerprint_alone_is_exactly_at_threshold() {
    let eval = evaluate("test", &phone(), daytime(), &AbuseHistory::default());
    assert_eq!(eval.score, 50);
    assert_eq!(eval.confidence(), 0.5);
    assert!(!eval.is_abuse(), "0.5 must not trigger");
    assert_eq!(eval.tags(), vec!["invalid_fingerprint"]);
}

#[test]
fn placeholder_plus_any_signal_triggers() {
    let night = Utc.with_ymd_and_hms(2026, 3, 4, 23, 30, 0).unwrap();
    let eval = evaluate("test", &phone(), night, &AbuseHistory::default());
    assert_eq!(eval.score, 60);
    assert!(eval.is_abuse());

    let sim = DeviceInfo {
        is_simulator: true,
        ..phone()
    };
    assert!(evaluate("test", &sim, daytime(), &AbuseHistory::default()).is_abuse());

    let history = AbuseHistory {
        trials_for_user: 1,
        ..Default::default()
    };
    assert!(evaluate("test", &phone(), daytime(), &history).is_abuse());
}

#[test]
fn repeat_trial_within_a_day_is_abuse() {
    let now = daytime();
    let history = AbuseHistory {
        trials_with_fingerprint: 1,
        trials_for_user: 1,
        last_user_trial_created_at: Some(now - Duration::hours(2)),
    };
    let eval = evaluate(GOOD_FP, &phone(), now, &history);
    assert!(eval.confidence() >= 0.7);
    assert!(eval.is_abuse());
    assert_eq!(
        eval.patterns,
        vec![
            AbusePattern::MultipleTrialsSameFingerprint,
            AbusePattern::MultipleTrialsSameUser,
            AbusePattern::RapidTrialCreation,
        ]
    );
}

#[test]
fn rapid_rule_expires_after_window() {
    let now = daytime();
    let history = AbuseHistory {
        last_user_trial_created_at: Some(now - Duration::hours(25)),
        ..Default::default()
    };
    let eval = evaluate(GOOD_FP, &phone(), now, &history);
    assert!(!eval.patterns.contains(&AbusePattern::RapidTrialCreation));
}

#[test]
fn shared_fingerprint_alone_is_not_abuse() {
    let history = AbuseHistory {
        trials_with_fingerprint: 3,
        ..Default::default()
    };
    let eval = evaluate(GOOD_FP, &phone(), daytime(), &history);
    assert_eq!(eval.score, 40);
    assert!(!eval.is_abuse());
}

#[test]
fn night_window_boundaries() {
    let at = |h, m| Utc.with_ymd_and_hms(2026, 3, 4, h, m, 0).unwrap();
    let unusual = |t| {
        evaluate(GOOD_FP, &phone(), t, &AbuseHistory::default())
            .patterns
            .contains(&AbusePattern::UnusualHours)
    };

    assert!(unusual(at(5, 59)));
    assert!(!unusual(at(6, 0)));
    assert!(!unusual(at(21, 59)));
    assert!(unusual(at(22, 0)));
    assert!(unusual(at(0, 0)));
}

#[test]
fn night_window_uses_server_offset() {
    // 12:00 UTC is 00:00 at UTC+12.
    let engine = AbuseEngine::new(AbuseEngineConfig {
        server_offset: FixedOffset::east_opt(12 * 3600).unwrap(),
        ..Default::default()
    });
    let device = phone();
    let signals = AbuseSignals {
        user_id: "user-1",
        fingerprint: GOOD_FP,
        device_info: &device,
        request_time: Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap(),
    };
    let eval = engine.evaluate(&signals, &AbuseHistory::default());
    assert_eq!(eval.patterns, vec![AbusePattern::UnusualHours]);
}

#[test]
fn simulator_model_is_detected() {
    let device = DeviceInfo {
        model: "x86_64".into(),
        ..phone()
    };
    let eval = evaluate(GOOD_FP, &device, daytime(), &AbuseHistory::default());
    assert_eq!(eval.patterns, vec![AbusePattern::SimulatorDevice]);
}

#[test]
fn invalid_fingerprint_rules() {
    assert!(is_invalid_fingerprint(""));
    assert!(is_invalid_fingerprint("short"));
    assert!(is_invalid_fingerprint(&"a".repeat(31)));
    assert!(!is_invalid_fingerprint(&"a".repeat(32)));
    assert!(is_invalid_fingerprint("00000000-0000-0000-0000-000000000000"));
    assert!(is_invalid_fingerprint("  TEST  "));
    assert!(!is_invalid_fingerprint(GOOD_FP));
}

// ── Aggregation ──────────────────────────────────────────────────

#[test]
fn score_is_not_clamped_but_confidence_is() {
    let night = Utc.with_ymd_and_hms(2026, 3, 4, 3, 0, 0).unwrap();
    let history = AbuseHistory {
        trials_with_fingerprint: 2,
        trials_for_user: 2,
        last_user_trial_created_at: Some(night - Duration::minutes(5)),
    };
    let sim = DeviceInfo {
        is_simulator: true,
        ..phone()
    };
    let eval = evaluate("test", &sim, night, &history);
    assert_eq!(eval.score, 180);
    assert_eq!(eval.raw_confidence(), 1.8);
    assert_eq!(eval.confidence(), 1.0);
    assert_eq!(eval.patterns, AbusePattern::ALL.to_vec());

    let result = eval.to_result();
    assert!(result.is_abuse);
    assert!(result.reason.unwrap().contains("invalid_fingerprint"));
}

fn device_strategy() -> impl Strategy<Value = DeviceInfo> {
    any::<bool>().prop_map(|is_simulator| DeviceInfo {
        is_simulator,
        ..phone()
    })
}

fn history_strategy() -> impl Strategy<Value = AbuseHistory> {
    (0u32..4, 0u32..4, prop::option::of(0i64..72)).prop_map(|(fp, user, hours_ago)| {
        AbuseHistory {
            trials_with_fingerprint: fp,
            trials_for_user: user,
            last_user_trial_created_at: hours_ago.map(|h| daytime() - Duration::hours(h)),
        }
    })
}

proptest! {
    #[test]
    fn score_is_sum_of_triggered_weights(
        fp in prop::sample::select(vec!["test".to_string(), GOOD_FP.to_string(), "abc".to_string()]),
        device in device_strategy(),
        hour in 0u32..24,
        history in history_strategy(),
    ) {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, hour, 0, 0).unwrap();
        let eval = evaluate(&fp, &device, at, &history);

        let expected: u32 = eval.patterns.iter().map(|p| p.weight_hundredths()).sum();
        prop_assert_eq!(eval.score, expected);
        prop_assert_eq!(eval.is_abuse(), eval.score > ABUSE_THRESHOLD);

        // Rule-table order, no duplicates.
        let positions: Vec<usize> = eval
            .patterns
            .iter()
            .map(|p| AbusePattern::ALL.iter().position(|q| q == p).unwrap())
            .collect();
        prop_assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn evaluation_is_deterministic(history in history_strategy(), hour in 0u32..24) {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, hour, 0, 0).unwrap();
        let a = evaluate(GOOD_FP, &phone(), at, &history);
        let b = evaluate(GOOD_FP, &phone(), at, &history);
        prop_assert_eq!(a, b);
    }
}

mod common;

use chrono::{Duration, TimeZone, Utc};
use common::{eventually, fingerprint, start_time};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio::sync::watch;
use vivid_registry::{AbuseEvent, CreateOutcome, Registry};
use vivid_server::scheduler::{run_abuse_report, run_expiry_sweep, REPORT_WINDOW_DAYS};
use vivid_server::{ScheduleConfig, Scheduler, SweepReport};
use vivid_types::{Clock, ManualClock, TrialId, TrialPolicy, TrialRecord, TrialType};

fn registry() -> Registry {
    Registry::open_in_memory(TrialPolicy::default()).unwrap()
}

fn seed_trial(registry: &Registry, user_id: &str, started: chrono::DateTime<Utc>) -> TrialId {
    let record = TrialRecord::new(
        user_id,
        format!("install-{user_id}"),
        fingerprint(user_id.len() as u32),
        TrialType::Limited,
        registry.policy(),
        started,
    );
    match registry.create_trial_if_none_active(record).unwrap() {
        CreateOutcome::Created(r) => r.trial_id,
        other => panic!("seed failed: {other:?}"),
    }
}

fn event(user_id: &str, is_abuse: bool, patterns: &[&str], at: chrono::DateTime<Utc>) -> AbuseEvent {
    AbuseEvent {
        user_id: user_id.into(),
        device_fingerprint: fingerprint(1),
        confidence: if is_abuse { 0.7 } else { 0.1 },
        is_abuse,
        patterns: patterns.iter().map(|p| p.to_string()).collect(),
        created_at: at,
    }
}

// ── Expiry sweep ─────────────────────────────────────────────────

#[test]
fn sweep_expires_old_trials_exactly_once() {
    let registry = registry();
    let now = start_time();
    let old_a = seed_trial(&registry, "alice", now - Duration::days(5));
    let old_b = seed_trial(&registry, "bob", now - Duration::days(3) - Duration::minutes(1));
    let fresh = seed_trial(&registry, "carol", now - Duration::days(1));

    let first = run_expiry_sweep(&registry, now);
    assert_eq!(
        first,
        SweepReport {
            examined: 2,
            expired: 2,
            failed: 0
        }
    );

    let second = run_expiry_sweep(&registry, now);
    assert_eq!(second, SweepReport::default());

    for id in [old_a, old_b] {
        assert!(!registry.get_trial(&id).unwrap().unwrap().is_active);
    }
    assert!(registry.get_trial(&fresh).unwrap().unwrap().is_active);
    assert_eq!(registry.active_trial_count().unwrap(), 1);
}

#[test]
fn sweep_on_empty_registry_is_a_no_op() {
    assert_eq!(run_expiry_sweep(&registry(), start_time()), SweepReport::default());
}

// ── Abuse report ─────────────────────────────────────────────────

#[test]
fn report_covers_the_prior_week_only() {
    let registry = registry();
    let now = Utc.with_ymd_and_hms(2026, 3, 9, 3, 0, 0).unwrap();
    let trial = seed_trial(&registry, "alice", now - Duration::days(1));

    let events = [
        event("old", true, &["invalid_fingerprint"], now - Duration::days(8)),
        event("a", true, &["simulator_device", "invalid_fingerprint"], now - Duration::days(3)),
        event("b", false, &["unusual_hours"], now - Duration::days(1)),
        event("c", false, &[], now - Duration::days(REPORT_WINDOW_DAYS)),
        event("late", true, &["invalid_fingerprint"], now),
    ];
    for e in &events {
        registry.log_abuse_event(e).unwrap();
    }

    let report = run_abuse_report(&registry, now).unwrap();
    assert!(report.id.is_some());
    assert_eq!(report.period_start, now - Duration::days(7));
    assert_eq!(report.period_end, now);
    assert_eq!(report.evaluations, 3);
    assert_eq!(report.abuse_count, 1);
    assert_eq!(report.pattern_counts.get("invalid_fingerprint"), Some(&1));
    assert_eq!(report.pattern_counts.get("simulator_device"), Some(&1));
    assert_eq!(report.pattern_counts.get("unusual_hours"), Some(&1));

    let saved = registry.recent_abuse_reports(1).unwrap();
    assert_eq!(saved, vec![report]);

    // Reporting never touches trials.
    let stored = registry.get_trial(&trial).unwrap().unwrap();
    assert!(stored.is_active);
}

// ── Loop ─────────────────────────────────────────────────────────

#[tokio::test]
async fn scheduler_runs_the_sweep_when_due() {
    let registry = Arc::new(registry());
    let sweep_at = Utc.with_ymd_and_hms(2026, 3, 5, 2, 0, 0).unwrap();
    let trial = seed_trial(&registry, "alice", sweep_at - Duration::days(4));

    let clock = ManualClock::new(sweep_at - Duration::milliseconds(200));
    let scheduler = Scheduler::new(
        Arc::clone(&registry),
        Arc::new(clock.clone()),
        ScheduleConfig::default(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(shutdown_rx));

    // The loop sleeps ~200ms of real time; move the clock past the slot meanwhile.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    clock.advance(Duration::seconds(1));

    let reg = Arc::clone(&registry);
    assert!(
        eventually(|| !reg.get_trial(&trial).unwrap().unwrap().is_active).await,
        "sweep did not run"
    );

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
}

#[tokio::test]
async fn scheduler_stops_when_sender_drops() {
    let clock = ManualClock::new(start_time());
    let scheduler = Scheduler::new(
        Arc::new(registry()),
        Arc::new(clock),
        ScheduleConfig::default(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(shutdown_rx));
    drop(shutdown_tx);

    tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
}

#[tokio::test]
async fn on_demand_jobs_use_the_scheduler_clock() {
    let registry = Arc::new(registry());
    let now = start_time();
    seed_trial(&registry, "alice", now - Duration::days(2));
    let clock = ManualClock::new(now);
    let scheduler = Scheduler::new(
        Arc::clone(&registry),
        Arc::new(clock.clone()),
        ScheduleConfig::default(),
    );

    assert_eq!(scheduler.sweep_now().await.expired, 0);
    clock.advance(Duration::days(2));
    assert_eq!(scheduler.sweep_now().await.expired, 1);

    let report = scheduler.report_now().await.unwrap();
    assert_eq!(report.period_end, clock.now());
    assert_eq!(report.evaluations, 0);
}

//! Reconciliation jobs.
//!
//! Two jobs run against the registry on a wall-clock schedule in the
//! server's configured offset:
//! - the expiry sweep (daily) flips expired trials to inactive
//! - the abuse report (weekly) summarizes the prior week's abuse events
//!
//! Both are safe to re-run. Neither ever brings the process down: failures
//! are logged and the loop waits for the next slot.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, Offset, Utc, Weekday};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use vivid_registry::{AbuseReport, Registry, RegistryResult};
use vivid_types::Clock;

/// Length of the window covered by one abuse report.
pub const REPORT_WINDOW_DAYS: i64 = 7;

/// When the jobs run, in server local time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub offset: FixedOffset,
    /// Local hour of the daily expiry sweep.
    pub sweep_hour: u32,
    pub report_weekday: Weekday,
    /// Local hour of the weekly abuse report.
    pub report_hour: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            offset: Utc.fix(),
            sweep_hour: 2,
            report_weekday: Weekday::Mon,
            report_hour: 3,
        }
    }
}

impl ScheduleConfig {
    /// Next sweep strictly after `now`.
    #[must_use]
    pub fn next_sweep(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        next_daily(now, self.offset, self.sweep_hour)
    }

    /// Next report strictly after `now`.
    #[must_use]
    pub fn next_report(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        next_weekly(now, self.offset, self.report_weekday, self.report_hour)
    }
}

/// Counts from one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired-but-active trials found.
    pub examined: usize,
    /// Trials this run flipped to inactive.
    pub expired: usize,
    /// Trials whose update failed; they are retried on the next run.
    pub failed: usize,
}

/// Flips every active trial past its end date to inactive, one at a time.
///
/// A record another writer already deactivated counts as neither expired nor
/// failed, so two back-to-back sweeps produce exactly one transition per
/// trial.
pub fn run_expiry_sweep(registry: &Registry, now: DateTime<Utc>) -> SweepReport {
    let candidates = match registry.expired_active_trials(now) {
        Ok(ids) => ids,
        Err(e) => {
            error!(error = %e, "expiry sweep could not list candidates");
            return SweepReport::default();
        }
    };

    let mut report = SweepReport {
        examined: candidates.len(),
        ..SweepReport::default()
    };
    for trial_id in candidates {
        match registry.deactivate_trial(&trial_id, now) {
            Ok(true) => report.expired += 1,
            Ok(false) => debug!(trial_id = %trial_id, "trial already inactive"),
            Err(e) => {
                report.failed += 1;
                warn!(trial_id = %trial_id, error = %e, "failed to deactivate trial");
            }
        }
    }

    info!(
        examined = report.examined,
        expired = report.expired,
        failed = report.failed,
        "expiry sweep finished"
    );
    report
}

/// Aggregates the abuse events of the `REPORT_WINDOW_DAYS` before `now` into
/// one persisted summary.
pub fn run_abuse_report(registry: &Registry, now: DateTime<Utc>) -> RegistryResult<AbuseReport> {
    let period_start = now - Duration::days(REPORT_WINDOW_DAYS);
    let events = registry.abuse_events_between(period_start, now)?;
    let mut report = AbuseReport::from_events(&events, period_start, now, now);
    report.id = Some(registry.save_abuse_report(&report)?);

    info!(
        evaluations = report.evaluations,
        abuse_count = report.abuse_count,
        patterns = ?report.pattern_counts,
        "weekly abuse report saved"
    );
    Ok(report)
}

/// Runs both jobs on their schedule until told to stop.
pub struct Scheduler {
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    config: ScheduleConfig,
}

impl Scheduler {
    #[must_use]
    pub fn new(registry: Arc<Registry>, clock: Arc<dyn Clock>, config: ScheduleConfig) -> Self {
        Self {
            registry,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Runs the expiry sweep now, off the async runtime.
    pub async fn sweep_now(&self) -> SweepReport {
        let registry = Arc::clone(&self.registry);
        let now = self.clock.now();
        match tokio::task::spawn_blocking(move || run_expiry_sweep(&registry, now)).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "expiry sweep task failed");
                SweepReport::default()
            }
        }
    }

    /// Builds and saves the weekly report now. Returns `None` on failure.
    pub async fn report_now(&self) -> Option<AbuseReport> {
        let registry = Arc::clone(&self.registry);
        let now = self.clock.now();
        match tokio::task::spawn_blocking(move || run_abuse_report(&registry, now)).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                error!(error = %e, "abuse report failed");
                None
            }
            Err(e) => {
                error!(error = %e, "abuse report task failed");
                None
            }
        }
    }

    /// Sleeps until the next due job, runs it, and repeats. Returns once
    /// `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let now = self.clock.now();
        let mut next_sweep = self.config.next_sweep(now);
        let mut next_report = self.config.next_report(now);
        info!(%next_sweep, %next_report, "scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let due = next_sweep.min(next_report);
            let wait = (due - self.clock.now()).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let now = self.clock.now();
            if now >= next_sweep {
                self.sweep_now().await;
                next_sweep = self.config.next_sweep(now);
            }
            if now >= next_report {
                self.report_now().await;
                next_report = self.config.next_report(now);
            }
        }
        info!("scheduler stopped");
    }
}

/// The next instant strictly after `now` at `hour:00` local time.
#[must_use]
pub fn next_daily(now: DateTime<Utc>, offset: FixedOffset, hour: u32) -> DateTime<Utc> {
    let local = now.with_timezone(&offset).naive_local();
    let mut candidate = local.date().and_time(at_hour(hour));
    if candidate <= local {
        candidate += Duration::days(1);
    }
    to_utc(candidate, offset)
}

/// The next instant strictly after `now` on `weekday` at `hour:00` local time.
#[must_use]
pub fn next_weekly(
    now: DateTime<Utc>,
    offset: FixedOffset,
    weekday: Weekday,
    hour: u32,
) -> DateTime<Utc> {
    let local = now.with_timezone(&offset).naive_local();
    let days_ahead = (7 + weekday.num_days_from_monday() - local.weekday().num_days_from_monday()) % 7;
    let mut candidate = (local.date() + Duration::days(i64::from(days_ahead))).and_time(at_hour(hour));
    if candidate <= local {
        candidate += Duration::days(7);
    }
    to_utc(candidate, offset)
}

fn at_hour(hour: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN)
}

fn to_utc(local: chrono::NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    (local - Duration::seconds(i64::from(offset.local_minus_utc()))).and_utc()
}

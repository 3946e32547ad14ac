//! Abuse evaluation log and the weekly summaries built from it.

use crate::error::RegistryResult;
use crate::rows::{from_millis, to_millis};
use crate::Registry;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vivid_types::AbusePattern;

/// One abuse evaluation, logged whether or not it flagged abuse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbuseEvent {
    pub user_id: String,
    pub device_fingerprint: String,
    /// Reported (clamped) confidence.
    pub confidence: f64,
    pub is_abuse: bool,
    pub patterns: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Summary of the abuse events in a half-open window `[period_start, period_end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbuseReport {
    /// Row id once persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub evaluations: u64,
    pub abuse_count: u64,
    /// How often each pattern tag fired. Every known pattern is present,
    /// with zero when it never fired.
    pub pattern_counts: BTreeMap<String, u64>,
    pub created_at: DateTime<Utc>,
}

impl AbuseReport {
    /// Builds a report from a batch of events.
    #[must_use]
    pub fn from_events(
        events: &[AbuseEvent],
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut pattern_counts: BTreeMap<String, u64> = AbusePattern::ALL
            .iter()
            .map(|p| (p.tag().to_string(), 0))
            .collect();
        for tag in events.iter().flat_map(|e| e.patterns.iter()) {
            *pattern_counts.entry(tag.clone()).or_insert(0) += 1;
        }
        Self {
            id: None,
            period_start,
            period_end,
            evaluations: events.len() as u64,
            abuse_count: events.iter().filter(|e| e.is_abuse).count() as u64,
            pattern_counts,
            created_at,
        }
    }
}

type EventRow = (String, String, f64, bool, String, i64);
type ReportRow = (i64, i64, i64, i64, i64, String, i64);

impl Registry {
    // ── Abuse events ─────────────────────────────────────────────

    /// Appends one evaluation to the abuse log.
    pub fn log_abuse_event(&self, event: &AbuseEvent) -> RegistryResult<()> {
        let patterns = serde_json::to_string(&event.patterns)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO abuse_events (user_id, device_fingerprint, confidence, is_abuse, patterns, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.user_id,
                event.device_fingerprint,
                event.confidence,
                event.is_abuse,
                patterns,
                to_millis(event.created_at),
            ],
        )?;
        Ok(())
    }

    /// Loads events logged in `[from, to)`, oldest first.
    pub fn abuse_events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RegistryResult<Vec<AbuseEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, device_fingerprint, confidence, is_abuse, patterns, created_at
             FROM abuse_events WHERE created_at >= ?1 AND created_at < ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![to_millis(from), to_millis(to)], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<Result<Vec<EventRow>, _>>()?;

        rows.into_iter()
            .map(
                |(user_id, device_fingerprint, confidence, is_abuse, patterns, created)| -> RegistryResult<AbuseEvent> {
                Ok(AbuseEvent {
                    user_id,
                    device_fingerprint,
                    confidence,
                    is_abuse,
                    patterns: serde_json::from_str(&patterns)?,
                    created_at: from_millis(created)?,
                })
            })
            .collect()
    }

    // ── Reports ──────────────────────────────────────────────────

    /// Persists a report and returns its row id.
    pub fn save_abuse_report(&self, report: &AbuseReport) -> RegistryResult<i64> {
        let counts = serde_json::to_string(&report.pattern_counts)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO abuse_reports (period_start, period_end, evaluations, abuse_count, pattern_counts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                to_millis(report.period_start),
                to_millis(report.period_end),
                report.evaluations as i64,
                report.abuse_count as i64,
                counts,
                to_millis(report.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Loads the most recent reports, newest first.
    pub fn recent_abuse_reports(&self, limit: usize) -> RegistryResult<Vec<AbuseReport>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, period_start, period_end, evaluations, abuse_count, pattern_counts, created_at
             FROM abuse_reports ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<Result<Vec<ReportRow>, _>>()?;

        rows.into_iter()
            .map(
                |(id, start, end, evaluations, abuse_count, counts, created)| -> RegistryResult<AbuseReport> {
                Ok(AbuseReport {
                    id: Some(id),
                    period_start: from_millis(start)?,
                    period_end: from_millis(end)?,
                    evaluations: evaluations.max(0) as u64,
                    abuse_count: abuse_count.max(0) as u64,
                    pattern_counts: serde_json::from_str(&counts)?,
                    created_at: from_millis(created)?,
                })
            })
            .collect()
    }
}

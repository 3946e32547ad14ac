//! Trial records: atomic creation, lookup, generation accounting and expiry.

use crate::error::{RegistryError, RegistryResult};
use crate::rows::{from_millis, to_millis, TrialRow, TRIAL_COLUMNS};
use crate::Registry;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};
use vivid_abuse::AbuseHistory;
use vivid_types::{TrialId, TrialRecord};

/// Outcome of [`Registry::create_trial_if_none_active`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The record was inserted.
    Created(TrialRecord),
    /// The user already held an active trial; nothing was written.
    AlreadyActive(TrialRecord),
}

/// Outcome of [`Registry::record_generation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// The counter was incremented; carries the updated record.
    Recorded(TrialRecord),
    NotFound,
    NotOwner,
    /// The trial is inactive or past its end date.
    Expired(TrialRecord),
    /// The cap was already reached.
    Exhausted(TrialRecord),
}

fn find_trial(conn: &Connection, trial_id: &TrialId) -> RegistryResult<Option<TrialRecord>> {
    let sql = format!("SELECT {TRIAL_COLUMNS} FROM trials WHERE trial_id = ?1");
    conn.query_row(&sql, params![trial_id.to_string()], TrialRow::read)
        .optional()?
        .map(TrialRow::into_record)
        .transpose()
}

fn find_active_for_user(conn: &Connection, user_id: &str) -> RegistryResult<Option<TrialRecord>> {
    let sql = format!("SELECT {TRIAL_COLUMNS} FROM trials WHERE user_id = ?1 AND is_active = 1");
    conn.query_row(&sql, params![user_id], TrialRow::read)
        .optional()?
        .map(TrialRow::into_record)
        .transpose()
}

fn insert_trial(conn: &Connection, record: &TrialRecord) -> RegistryResult<()> {
    conn.execute(
        "INSERT INTO trials (trial_id, user_id, device_id, device_fingerprint, trial_type,
            start_date, is_active, generations_used, max_generations, server_validated,
            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            record.trial_id.to_string(),
            record.user_id,
            record.device_id,
            record.device_fingerprint,
            record.trial_type.as_str(),
            to_millis(record.start_date),
            record.is_active,
            record.generations_used,
            record.max_generations,
            record.server_validated,
            to_millis(record.created_at),
            to_millis(record.updated_at),
        ],
    )?;
    Ok(())
}

impl Registry {
    // ── Lookup ───────────────────────────────────────────────────

    /// Loads a trial by id.
    pub fn get_trial(&self, trial_id: &TrialId) -> RegistryResult<Option<TrialRecord>> {
        let conn = self.conn()?;
        find_trial(&conn, trial_id)
    }

    /// Returns the user's active trial, if any.
    pub fn active_trial_for_user(&self, user_id: &str) -> RegistryResult<Option<TrialRecord>> {
        let conn = self.conn()?;
        find_active_for_user(&conn, user_id)
    }

    /// Returns every trial (active or not) created for a user, oldest first.
    pub fn trials_for_user(&self, user_id: &str) -> RegistryResult<Vec<TrialRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {TRIAL_COLUMNS} FROM trials WHERE user_id = ?1 ORDER BY created_at, trial_id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id], TrialRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(TrialRow::into_record).collect()
    }

    /// Gathers the history the abuse engine needs in a single read.
    pub fn abuse_history(&self, user_id: &str, fingerprint: &str) -> RegistryResult<AbuseHistory> {
        let conn = self.conn()?;
        let (by_fingerprint, by_user, last_created): (u32, u32, Option<i64>) = conn.query_row(
            "SELECT
                (SELECT COUNT(*) FROM trials WHERE device_fingerprint = ?2),
                (SELECT COUNT(*) FROM trials WHERE user_id = ?1),
                (SELECT MAX(created_at) FROM trials WHERE user_id = ?1)",
            params![user_id, fingerprint],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(AbuseHistory {
            trials_with_fingerprint: by_fingerprint,
            trials_for_user: by_user,
            last_user_trial_created_at: last_created
                .map(from_millis)
                .transpose()?,
        })
    }

    // ── Creation ─────────────────────────────────────────────────

    /// Inserts `record` unless the user already holds an active trial.
    ///
    /// The check and the insert run in one `IMMEDIATE` transaction, and the
    /// partial unique index on active rows backs it up against writers on
    /// other connections, so concurrent callers for the same user produce at
    /// most one active record.
    pub fn create_trial_if_none_active(&self, record: TrialRecord) -> RegistryResult<CreateOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = find_active_for_user(&tx, &record.user_id)? {
            debug!(user_id = %record.user_id, trial_id = %existing.trial_id, "active trial already present");
            return Ok(CreateOutcome::AlreadyActive(existing));
        }

        match insert_trial(&tx, &record) {
            Ok(()) => {}
            Err(e) if e.is_constraint_violation() => {
                drop(tx);
                return match find_active_for_user(&conn, &record.user_id)? {
                    Some(existing) => Ok(CreateOutcome::AlreadyActive(existing)),
                    None => Err(e),
                };
            }
            Err(e) => return Err(e),
        }
        tx.commit()?;

        info!(
            user_id = %record.user_id,
            trial_id = %record.trial_id,
            trial_type = %record.trial_type,
            "trial created"
        );
        Ok(CreateOutcome::Created(record))
    }

    // ── Generations ──────────────────────────────────────────────

    /// Counts one generation against a trial, re-checking ownership, expiry
    /// and the cap inside the same transaction as the increment.
    pub fn record_generation(
        &self,
        trial_id: &TrialId,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> RegistryResult<GenerationOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(mut record) = find_trial(&tx, trial_id)? else {
            return Ok(GenerationOutcome::NotFound);
        };
        if record.user_id != user_id {
            return Ok(GenerationOutcome::NotOwner);
        }
        if !record.is_active || record.is_expired_at(self.policy().duration(), now) {
            return Ok(GenerationOutcome::Expired(record));
        }
        if record.generations_exhausted() {
            return Ok(GenerationOutcome::Exhausted(record));
        }

        tx.execute(
            "UPDATE trials SET generations_used = generations_used + 1, updated_at = ?2
             WHERE trial_id = ?1",
            params![trial_id.to_string(), to_millis(now)],
        )?;
        tx.commit()?;

        record.generations_used += 1;
        record.updated_at = now;
        debug!(
            trial_id = %trial_id,
            used = record.generations_used,
            max = record.max_generations,
            "generation recorded"
        );
        Ok(GenerationOutcome::Recorded(record))
    }

    // ── Expiry ───────────────────────────────────────────────────

    /// Marks a trial inactive. Returns `true` only if this call flipped it,
    /// so repeated calls are harmless.
    pub fn deactivate_trial(&self, trial_id: &TrialId, now: DateTime<Utc>) -> RegistryResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE trials SET is_active = 0, updated_at = ?2 WHERE trial_id = ?1 AND is_active = 1",
            params![trial_id.to_string(), to_millis(now)],
        )?;
        if changed > 0 {
            info!(trial_id = %trial_id, "trial deactivated");
        }
        Ok(changed > 0)
    }

    /// Ids of active trials whose end date is strictly before `now`.
    pub fn expired_active_trials(&self, now: DateTime<Utc>) -> RegistryResult<Vec<TrialId>> {
        let cutoff = now - self.policy().duration();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT trial_id FROM trials WHERE is_active = 1 AND start_date < ?1 ORDER BY start_date",
        )?;
        let ids = stmt
            .query_map(params![to_millis(cutoff)], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        ids.iter()
            .map(|id| {
                TrialId::parse(id)
                    .map_err(|e| RegistryError::InvalidData(format!("trial id {id}: {e}")))
            })
            .collect()
    }

    /// Number of active trials across all users.
    pub fn active_trial_count(&self) -> RegistryResult<u64> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM trials WHERE is_active = 1", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

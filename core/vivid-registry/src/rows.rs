//! Row decoding helpers shared by the table modules.

use crate::error::{RegistryError, RegistryResult};
use chrono::{DateTime, Utc};
use rusqlite::Row;
use vivid_types::{TrialId, TrialRecord, TrialType};

/// Columns selected for every trial query, in `TrialRow::read` order.
pub(crate) const TRIAL_COLUMNS: &str = "trial_id, user_id, device_id, device_fingerprint, \
     trial_type, start_date, is_active, generations_used, max_generations, \
     server_validated, created_at, updated_at";

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> RegistryResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| RegistryError::InvalidData(format!("timestamp out of range: {ms}")))
}

/// Raw trial columns, decoded into a [`TrialRecord`] outside the row closure.
pub(crate) struct TrialRow {
    trial_id: String,
    user_id: String,
    device_id: String,
    device_fingerprint: String,
    trial_type: String,
    start_date: i64,
    is_active: bool,
    generations_used: u32,
    max_generations: u32,
    server_validated: bool,
    created_at: i64,
    updated_at: i64,
}

impl TrialRow {
    pub(crate) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            trial_id: row.get(0)?,
            user_id: row.get(1)?,
            device_id: row.get(2)?,
            device_fingerprint: row.get(3)?,
            trial_type: row.get(4)?,
            start_date: row.get(5)?,
            is_active: row.get(6)?,
            generations_used: row.get(7)?,
            max_generations: row.get(8)?,
            server_validated: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    pub(crate) fn into_record(self) -> RegistryResult<TrialRecord> {
        let trial_id = TrialId::parse(&self.trial_id)
            .map_err(|e| RegistryError::InvalidData(format!("trial id {}: {e}", self.trial_id)))?;
        let trial_type: TrialType = self
            .trial_type
            .parse()
            .map_err(|e| RegistryError::InvalidData(format!("{e}")))?;

        Ok(TrialRecord {
            trial_id,
            user_id: self.user_id,
            device_id: self.device_id,
            device_fingerprint: self.device_fingerprint,
            trial_type,
            start_date: from_millis(self.start_date)?,
            is_active: self.is_active,
            generations_used: self.generations_used,
            max_generations: self.max_generations,
            server_validated: self.server_validated,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

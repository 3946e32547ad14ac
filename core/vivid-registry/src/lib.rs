//! Authoritative trial and referral registry.
//!
//! Backed by a single SQLite database. The registry is the only shared
//! mutable state on the server: request handlers read through it, and the
//! two write paths that must be indivisible (trial check-and-create, and
//! generation recording) each run inside one `IMMEDIATE` transaction.
//!
//! # Tables
//!
//! - `trials`: one row per trial ever granted; rows are deactivated, never
//!   deleted. A partial unique index allows at most one active row per user.
//! - `referrals`: single-use referral codes and their redemption.
//! - `abuse_events`: one row per abuse evaluation (decision + patterns).
//! - `abuse_reports`: weekly summaries of `abuse_events`.

mod analytics;
mod error;
mod referrals;
mod rows;
mod trials;

pub use analytics::{AbuseEvent, AbuseReport};
pub use error::{RegistryError, RegistryResult};
pub use referrals::{
    generate_referral_code, normalize_referral_code, reasons as referral_reasons,
    RedemptionOutcome, REFERRAL_CODE_ALPHABET, REFERRAL_CODE_LEN,
};
pub use trials::{CreateOutcome, GenerationOutcome};

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;
use vivid_types::TrialPolicy;

/// How long a writer waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Persistent trial/referral registry backed by SQLite.
pub struct Registry {
    conn: Arc<Mutex<Connection>>,
    policy: TrialPolicy,
}

impl Registry {
    /// Opens (or creates) a registry at the given path.
    pub fn open(path: &Path, policy: TrialPolicy) -> RegistryResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        info!(path = %path.display(), "opened trial registry");
        Self::from_connection(conn, policy)
    }

    /// Opens an in-memory registry (for testing).
    pub fn open_in_memory(policy: TrialPolicy) -> RegistryResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::from_connection(conn, policy)
    }

    fn from_connection(conn: Connection, policy: TrialPolicy) -> RegistryResult<Self> {
        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
            policy,
        };
        registry.init_schema()?;
        Ok(registry)
    }

    /// Returns the trial policy this registry enforces.
    pub fn policy(&self) -> &TrialPolicy {
        &self.policy
    }

    pub(crate) fn conn(&self) -> RegistryResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| RegistryError::Poisoned)
    }

    fn init_schema(&self) -> RegistryResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS trials (
                trial_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                device_fingerprint TEXT NOT NULL,
                trial_type TEXT NOT NULL,
                start_date INTEGER NOT NULL,
                is_active INTEGER NOT NULL,
                generations_used INTEGER NOT NULL DEFAULT 0,
                max_generations INTEGER NOT NULL,
                server_validated INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS trials_one_active_per_user
                ON trials (user_id) WHERE is_active = 1;
            CREATE INDEX IF NOT EXISTS trials_by_user ON trials (user_id, created_at);
            CREATE INDEX IF NOT EXISTS trials_by_fingerprint ON trials (device_fingerprint);
            CREATE INDEX IF NOT EXISTS trials_active_start ON trials (is_active, start_date);

            CREATE TABLE IF NOT EXISTS referrals (
                referral_code TEXT PRIMARY KEY,
                referrer_id TEXT NOT NULL,
                referee_id TEXT UNIQUE,
                rewards_granted INTEGER NOT NULL DEFAULT 0,
                device_fingerprint TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                redeemed_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS referrals_by_referrer ON referrals (referrer_id);

            CREATE TABLE IF NOT EXISTS abuse_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                device_fingerprint TEXT NOT NULL,
                confidence REAL NOT NULL,
                is_abuse INTEGER NOT NULL,
                patterns TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS abuse_events_by_time ON abuse_events (created_at);

            CREATE TABLE IF NOT EXISTS abuse_reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                period_start INTEGER NOT NULL,
                period_end INTEGER NOT NULL,
                evaluations INTEGER NOT NULL,
                abuse_count INTEGER NOT NULL,
                pattern_counts TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }
}

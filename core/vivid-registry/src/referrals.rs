//! Referral codes.
//!
//! Codes are single-use. A referrer holds at most one open (unredeemed) code
//! at a time; once it is redeemed, the next request issues a fresh one. The
//! referrer's reward total is the number of their codes that were redeemed.

use crate::error::{RegistryError, RegistryResult};
use crate::rows::{from_millis, to_millis};
use crate::Registry;
use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};
use vivid_types::ReferralRecord;

/// Characters used in generated codes; excludes 0/O and 1/I.
pub const REFERRAL_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of generated codes.
pub const REFERRAL_CODE_LEN: usize = 8;

const MAX_CODE_ATTEMPTS: usize = 5;

/// Human-readable reasons for refused redemptions.
pub mod reasons {
    pub const CODE_NOT_FOUND: &str = "Referral code not found";
    pub const OWN_CODE: &str = "Cannot redeem your own referral code";
    pub const SAME_DEVICE: &str = "Referral from the same device is not allowed";
    pub const ALREADY_REDEEMED: &str = "Referral code already redeemed";
    pub const REFEREE_ALREADY_REFERRED: &str = "User has already redeemed a referral";
}

/// Outcome of [`Registry::redeem_referral`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedemptionOutcome {
    /// The code was redeemed; carries the referrer's new reward total.
    Redeemed { referrer_id: String, rewards_total: u32 },
    Rejected(&'static str),
}

const REFERRAL_COLUMNS: &str = "referral_code, referrer_id, referee_id, rewards_granted, \
     device_fingerprint, created_at, redeemed_at";

type ReferralRow = (String, String, Option<String>, u32, String, i64, Option<i64>);

fn read_row(row: &Row<'_>) -> rusqlite::Result<ReferralRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn into_record(row: ReferralRow) -> RegistryResult<ReferralRecord> {
    let (referral_code, referrer_id, referee_id, rewards_granted, device_fingerprint, created, redeemed) =
        row;
    Ok(ReferralRecord {
        referral_code,
        referrer_id,
        referee_id,
        rewards_granted,
        device_fingerprint,
        created_at: from_millis(created)?,
        redeemed_at: redeemed.map(from_millis).transpose()?,
    })
}

fn find_by_code(conn: &Connection, code: &str) -> RegistryResult<Option<ReferralRecord>> {
    let sql = format!("SELECT {REFERRAL_COLUMNS} FROM referrals WHERE referral_code = ?1");
    conn.query_row(&sql, params![code], read_row)
        .optional()?
        .map(into_record)
        .transpose()
}

fn rewards_total(conn: &Connection, referrer_id: &str) -> RegistryResult<u32> {
    let total: u32 = conn.query_row(
        "SELECT COALESCE(SUM(rewards_granted), 0) FROM referrals WHERE referrer_id = ?1",
        params![referrer_id],
        |row| row.get(0),
    )?;
    Ok(total)
}

/// Generates a random code from [`REFERRAL_CODE_ALPHABET`].
pub fn generate_referral_code() -> String {
    let mut rng = rand::thread_rng();
    (0..REFERRAL_CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..REFERRAL_CODE_ALPHABET.len());
            char::from(REFERRAL_CODE_ALPHABET[idx])
        })
        .collect()
}

/// Uppercases and trims user-entered codes.
pub fn normalize_referral_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

impl Registry {
    /// Loads a referral by code (case-insensitive).
    pub fn get_referral(&self, code: &str) -> RegistryResult<Option<ReferralRecord>> {
        let conn = self.conn()?;
        find_by_code(&conn, &normalize_referral_code(code))
    }

    /// Returns the referrer's open code, issuing one if they have none.
    ///
    /// The returned record's `rewards_granted` is the referrer's total across
    /// all their codes.
    pub fn get_or_create_referral(
        &self,
        referrer_id: &str,
        device_fingerprint: &str,
        now: DateTime<Utc>,
    ) -> RegistryResult<ReferralRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let open_sql = format!(
            "SELECT {REFERRAL_COLUMNS} FROM referrals
             WHERE referrer_id = ?1 AND referee_id IS NULL
             ORDER BY created_at DESC LIMIT 1"
        );
        let existing = tx
            .query_row(&open_sql, params![referrer_id], read_row)
            .optional()?
            .map(into_record)
            .transpose()?;

        let mut record = match existing {
            Some(record) => record,
            None => {
                let mut inserted = None;
                for _ in 0..MAX_CODE_ATTEMPTS {
                    let code = generate_referral_code();
                    let result = tx.execute(
                        "INSERT INTO referrals (referral_code, referrer_id, device_fingerprint, created_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![code, referrer_id, device_fingerprint, to_millis(now)],
                    );
                    match result.map_err(RegistryError::from) {
                        Ok(_) => {
                            inserted = Some(code);
                            break;
                        }
                        Err(e) if e.is_constraint_violation() => {
                            warn!(referrer_id, "referral code collision, retrying");
                        }
                        Err(e) => return Err(e),
                    }
                }
                let code = inserted.ok_or_else(|| {
                    RegistryError::InvalidData("could not allocate a unique referral code".into())
                })?;
                info!(referrer_id, referral_code = %code, "referral code issued");
                ReferralRecord {
                    referral_code: code,
                    referrer_id: referrer_id.to_string(),
                    referee_id: None,
                    rewards_granted: 0,
                    device_fingerprint: device_fingerprint.to_string(),
                    created_at: now,
                    redeemed_at: None,
                }
            }
        };

        record.rewards_granted = rewards_total(&tx, referrer_id)?;
        tx.commit()?;
        Ok(record)
    }

    /// Redeems a code on behalf of `referee_id`.
    ///
    /// Self-referral, same-device referral, reuse of a code, and a second
    /// redemption by the same referee are all refused.
    pub fn redeem_referral(
        &self,
        code: &str,
        referee_id: &str,
        referee_fingerprint: &str,
        now: DateTime<Utc>,
    ) -> RegistryResult<RedemptionOutcome> {
        let code = normalize_referral_code(code);
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(record) = find_by_code(&tx, &code)? else {
            return Ok(RedemptionOutcome::Rejected(reasons::CODE_NOT_FOUND));
        };
        if record.referrer_id == referee_id {
            return Ok(RedemptionOutcome::Rejected(reasons::OWN_CODE));
        }
        if record.device_fingerprint == referee_fingerprint {
            return Ok(RedemptionOutcome::Rejected(reasons::SAME_DEVICE));
        }
        if record.is_redeemed() {
            return Ok(RedemptionOutcome::Rejected(reasons::ALREADY_REDEEMED));
        }
        let already_referred: bool = tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM referrals WHERE referee_id = ?1)",
            params![referee_id],
            |row| row.get(0),
        )?;
        if already_referred {
            return Ok(RedemptionOutcome::Rejected(reasons::REFEREE_ALREADY_REFERRED));
        }

        tx.execute(
            "UPDATE referrals
             SET referee_id = ?2, redeemed_at = ?3, rewards_granted = rewards_granted + 1
             WHERE referral_code = ?1 AND referee_id IS NULL",
            params![code, referee_id, to_millis(now)],
        )?;
        let total = rewards_total(&tx, &record.referrer_id)?;
        tx.commit()?;

        debug!(referral_code = %code, referee_id, "referral redeemed");
        Ok(RedemptionOutcome::Redeemed {
            referrer_id: record.referrer_id,
            rewards_total: total,
        })
    }
}

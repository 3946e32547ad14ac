//! Encrypted on-device entitlement cache.
//!
//! The cache holds the last trial/referral projection the server confirmed.
//! It lets the app answer "may I generate?" without a round trip, but it is
//! never the source of truth: anything that fails to decrypt or parse is
//! treated as absent and the next successful sync overwrites it.
//!
//! The key is derived with Argon2id from the device identity, and the sealed
//! envelope authenticates its header and the device id, so a blob copied from
//! another device or edited in place does not open.

use crate::device::DeviceIdentity;
use crate::error::{ClientError, ClientResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vivid_crypto::{derive_cache_key, open, seal, CacheKey, DeviceBinding, KdfParams};
use vivid_types::{ReferralCodeResponse, TrialSnapshot};

/// File name of the cache inside the store directory.
pub const CACHE_FILE_NAME: &str = "entitlements.bin";

/// Decrypted cache contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementCache {
    /// User the projection belongs to.
    pub user_id: String,
    pub trial: Option<TrialSnapshot>,
    pub referral: Option<ReferralCodeResponse>,
    /// When the server last confirmed this projection.
    pub last_sync: DateTime<Utc>,
    /// False once a sync attempt failed; consumption is refused until the
    /// next successful validation.
    pub verified: bool,
}

impl EntitlementCache {
    /// An empty, verified cache for a user.
    #[must_use]
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            trial: None,
            referral: None,
            last_sync: now,
            verified: true,
        }
    }
}

/// File-backed, encrypted store for one [`EntitlementCache`].
pub struct LocalEntitlementStore {
    path: PathBuf,
    key: CacheKey,
    context: Vec<u8>,
}

impl std::fmt::Debug for LocalEntitlementStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEntitlementStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl LocalEntitlementStore {
    /// Opens the store in `dir`, deriving the cache key from `identity`.
    ///
    /// Nothing is read or written until [`load`](Self::load) or
    /// [`save`](Self::save).
    pub fn open(dir: &Path, identity: &DeviceIdentity, params: &KdfParams) -> ClientResult<Self> {
        let binding = DeviceBinding {
            device_id: &identity.device_id,
            fingerprint: &identity.fingerprint,
        };
        let key = derive_cache_key(&binding, params)?;

        Ok(Self {
            path: dir.join(CACHE_FILE_NAME),
            key,
            context: binding.context().to_vec(),
        })
    }

    /// Path of the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and decrypts the cache. Any failure yields `None`.
    pub fn load(&self) -> Option<EntitlementCache> {
        let blob = match fs::read(&self.path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no entitlement cache on disk");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read entitlement cache");
                return None;
            }
        };

        let plaintext = match open(&self.key, &self.context, &blob) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(error = %e, "entitlement cache failed authentication, ignoring it");
                return None;
            }
        };

        match serde_json::from_slice(&plaintext) {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!(error = %e, "entitlement cache did not parse, ignoring it");
                None
            }
        }
    }

    /// Encrypts and atomically replaces the cache file.
    ///
    /// The blob goes to a temp file in the same directory, is synced, then
    /// renamed over the old one, so a failed write leaves the previous blob.
    pub fn save(&self, cache: &EntitlementCache) -> ClientResult<()> {
        let plaintext = serde_json::to_vec(cache)?;
        let blob = seal(&self.key, &self.context, &plaintext)?;

        let dir = self
            .path
            .parent()
            .ok_or_else(|| ClientError::Storage("cache path has no parent directory".into()))?;
        fs::create_dir_all(dir)
            .map_err(|e| ClientError::Storage(format!("failed to create {}: {e}", dir.display())))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| ClientError::Storage(format!("failed to create temp file: {e}")))?;
        tmp.write_all(&blob)
            .map_err(|e| ClientError::Storage(format!("failed to write cache: {e}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| ClientError::Storage(format!("failed to sync cache: {e}")))?;
        tmp.persist(&self.path)
            .map_err(|e| ClientError::Storage(format!("failed to replace cache: {}", e.error)))?;

        debug!(path = %self.path.display(), bytes = blob.len(), "entitlement cache saved");
        Ok(())
    }

    /// Deletes the cache file, if any.
    pub fn clear(&self) -> ClientResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ClientError::Storage(format!("failed to remove cache: {e}"))),
        }
    }
}

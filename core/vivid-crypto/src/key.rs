//! Device-bound cache keys.
//!
//! The cache key is never stored. Each time the store opens it is derived
//! again with Argon2id from the installation id and the hardware
//! fingerprint, so a blob copied to another device, or left behind after
//! the fingerprint changed, no longer opens.

use crate::error::{CryptoError, CryptoResult};
use argon2::{Algorithm, Argon2, Params, Version};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Cache key length (ChaCha20-Poly1305).
pub const KEY_LEN: usize = 32;

const SALT_LEN: usize = 16;
const SALT_LABEL: &[u8] = b"vivid-entitlement-cache";

/// Symmetric key for the entitlement cache. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CacheKey([u8; KEY_LEN]);

impl CacheKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub(crate) fn expose(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CacheKey(..)")
    }
}

/// The device attributes a cache blob is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBinding<'a> {
    pub device_id: &'a str,
    pub fingerprint: &'a str,
}

impl DeviceBinding<'_> {
    /// Associated data for sealing: the installation id.
    #[must_use]
    pub fn context(&self) -> &[u8] {
        self.device_id.as_bytes()
    }

    /// Per-installation salt, recomputable without storage.
    fn salt(&self) -> [u8; SALT_LEN] {
        let digest = Sha256::new()
            .chain_update(SALT_LABEL)
            .chain_update([0u8])
            .chain_update(self.device_id.as_bytes())
            .finalize();
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&digest[..SALT_LEN]);
        salt
    }

    fn secret(&self) -> Zeroizing<Vec<u8>> {
        let mut secret = Vec::with_capacity(self.device_id.len() + self.fingerprint.len() + 1);
        secret.extend_from_slice(self.device_id.as_bytes());
        secret.push(b'|');
        secret.extend_from_slice(self.fingerprint.as_bytes());
        Zeroizing::new(secret)
    }
}

/// Argon2id cost settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    pub passes: u32,
    pub lanes: u32,
}

impl Default for KdfParams {
    /// 19 MiB, two passes, one lane.
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            passes: 2,
            lanes: 1,
        }
    }
}

impl KdfParams {
    /// 1 MiB and a single pass, for tests and app extensions with tight
    /// memory limits.
    #[must_use]
    pub fn light() -> Self {
        Self {
            memory_kib: 1024,
            passes: 1,
            lanes: 1,
        }
    }
}

/// Derives the cache key for a device.
pub fn derive_cache_key(binding: &DeviceBinding<'_>, params: &KdfParams) -> CryptoResult<CacheKey> {
    let cost = Params::new(params.memory_kib, params.passes, params.lanes, Some(KEY_LEN))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let mut key = [0u8; KEY_LEN];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, cost)
        .hash_password_into(&binding.secret(), &binding.salt(), &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let derived = CacheKey::from_bytes(key);
    key.zeroize();
    Ok(derived)
}

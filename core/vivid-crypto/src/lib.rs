//! Encryption for the on-device entitlement cache.
//!
//! - ChaCha20-Poly1305 sealed envelopes, header and context authenticated
//! - Argon2id derivation of a key bound to the device
//!
//! A failed `open` means "no data". Callers never read anything from an
//! envelope that did not authenticate.

mod envelope;
mod error;
mod key;

pub use envelope::{
    open, seal, ENVELOPE_MAGIC, ENVELOPE_VERSION, HEADER_LEN, MIN_ENVELOPE_LEN, NONCE_LEN, TAG_LEN,
};
pub use error::{CryptoError, CryptoResult};
pub use key::{derive_cache_key, CacheKey, DeviceBinding, KdfParams, KEY_LEN};

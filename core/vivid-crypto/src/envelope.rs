//! Sealed envelopes.
//!
//! ```text
//! magic "VVEC" (4) | version (1) | nonce (12) | ciphertext | tag (16)
//! ```
//!
//! The header and the caller's context (for the cache, the installation id)
//! are authenticated as associated data along with the payload, so changing
//! any byte of the envelope, or opening it under another context, fails.

use crate::error::{CryptoError, CryptoResult};
use crate::key::CacheKey;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;

pub const ENVELOPE_MAGIC: [u8; 4] = *b"VVEC";
pub const ENVELOPE_VERSION: u8 = 1;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Magic plus version byte.
pub const HEADER_LEN: usize = ENVELOPE_MAGIC.len() + 1;

/// Smallest well-formed envelope (empty payload).
pub const MIN_ENVELOPE_LEN: usize = HEADER_LEN + NONCE_LEN + TAG_LEN;

fn associated_data(version: u8, context: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(HEADER_LEN + context.len());
    aad.extend_from_slice(&ENVELOPE_MAGIC);
    aad.push(version);
    aad.extend_from_slice(context);
    aad
}

/// Encrypts `plaintext` under a fresh random nonce.
pub fn seal(key: &CacheKey, context: &[u8], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let aad = associated_data(ENVELOPE_VERSION, context);
    let ciphertext = ChaCha20Poly1305::new(key.expose().into())
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
        .map_err(|_| CryptoError::Seal)?;

    let mut envelope = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext.len());
    envelope.extend_from_slice(&ENVELOPE_MAGIC);
    envelope.push(ENVELOPE_VERSION);
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Opens an envelope sealed with the same key and context.
pub fn open(key: &CacheKey, context: &[u8], envelope: &[u8]) -> CryptoResult<Vec<u8>> {
    if envelope.len() < MIN_ENVELOPE_LEN {
        return Err(CryptoError::Malformed("too short"));
    }
    let (header, body) = envelope.split_at(HEADER_LEN);
    if header[..ENVELOPE_MAGIC.len()] != ENVELOPE_MAGIC {
        return Err(CryptoError::Malformed("bad magic"));
    }
    let version = header[ENVELOPE_MAGIC.len()];
    if version != ENVELOPE_VERSION {
        return Err(CryptoError::UnsupportedVersion(version));
    }

    let (nonce, ciphertext) = body.split_at(NONCE_LEN);
    let aad = associated_data(version, context);
    ChaCha20Poly1305::new(key.expose().into())
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: &aad })
        .map_err(|_| CryptoError::Authentication)
}

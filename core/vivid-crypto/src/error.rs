use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("sealing failed")]
    Seal,

    /// Wrong key, wrong device, or the blob was modified.
    #[error("envelope failed authentication")]
    Authentication,

    #[error("malformed envelope: {0}")]
    Malformed(&'static str),

    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u8),
}

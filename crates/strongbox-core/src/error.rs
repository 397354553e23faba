use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid key length from {origin}: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        origin: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("Authentication failed (tag mismatch, wrong key or tampered data)")]
    AuthenticationFailed,

    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u64),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Timed out after {waited:?} waiting for lock on {}", resource.display())]
    LockTimeout { resource: PathBuf, waited: Duration },

    #[error("No key available: {0}")]
    NoKeyAvailable(&'static str),

    #[error("Key encapsulation failed: {0}")]
    Kem(String),

    #[error("Store is read-only")]
    ReadOnly,

    #[error("Blocking task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

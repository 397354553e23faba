//! On-disk envelope formats.
//!
//! - v1 (legacy): AES-256-GCM, `{iv, tag, ciphertext, salt?, encapsulatedKey?}`.
//!   It predates the version contract and is recognised by its `iv` + `tag`
//!   fields. Read-only; never written.
//! - v2 (classical): ChaCha20-Poly1305 under the classical key.
//! - v3 (hybrid): ChaCha20-Poly1305 under `SHA256(ML-KEM shared secret || salt)`.
//!
//! Every binary field is standard base64. v2/v3 `ciphertext` carries the
//! 16-byte Poly1305 tag at its end.

use crate::error::{Result, StoreError};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CLASSICAL_VERSION: u64 = 2;
pub const HYBRID_VERSION: u64 = 3;
pub const LEGACY_VERSION: u64 = 1;

pub const AEAD_ALGORITHM: &str = "chacha20-poly1305";
pub const KEM_ALGORITHM: &str = "ML-KEM-768";
pub const LEGACY_ALGORITHM: &str = "aes-256-gcm";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassicalEnvelope {
    pub version: u64,
    pub algorithm: String,
    pub nonce: String,
    pub salt: String,
    pub ciphertext: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridEnvelope {
    pub version: u64,
    pub algorithm: String,
    pub pq_algorithm: String,
    pub encapsulated_key: String,
    pub nonce: String,
    pub salt: String,
    pub ciphertext: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub iv: String,
    pub tag: String,
    pub ciphertext: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encapsulated_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Legacy(LegacyEnvelope),
    Classical(ClassicalEnvelope),
    Hybrid(HybridEnvelope),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Legacy,
    Classical,
    Hybrid,
}

impl Envelope {
    /// Classify a parsed JSON document. Legacy data is detected structurally
    /// because it may carry no version at all.
    pub fn detect(value: Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| StoreError::MalformedEnvelope("not a JSON object".into()))?;

        if obj.contains_key("iv") && obj.contains_key("tag") {
            let legacy: LegacyEnvelope = serde_json::from_value(value)
                .map_err(|e| StoreError::MalformedEnvelope(format!("legacy: {e}")))?;
            return Ok(Envelope::Legacy(legacy));
        }

        let version = obj
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| StoreError::MalformedEnvelope("missing version".into()))?;

        let envelope = match version {
            CLASSICAL_VERSION => {
                let env: ClassicalEnvelope = serde_json::from_value(value)
                    .map_err(|e| StoreError::MalformedEnvelope(format!("v2: {e}")))?;
                Envelope::Classical(env)
            }
            HYBRID_VERSION => {
                let env: HybridEnvelope = serde_json::from_value(value)
                    .map_err(|e| StoreError::MalformedEnvelope(format!("v3: {e}")))?;
                if env.pq_algorithm != KEM_ALGORITHM {
                    return Err(StoreError::UnsupportedAlgorithm(env.pq_algorithm));
                }
                Envelope::Hybrid(env)
            }
            other => return Err(StoreError::UnsupportedVersion(other)),
        };
        if envelope.algorithm() != AEAD_ALGORITHM {
            return Err(StoreError::UnsupportedAlgorithm(envelope.algorithm().to_string()));
        }
        Ok(envelope)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| StoreError::MalformedEnvelope(format!("not JSON: {e}")))?;
        Self::detect(value)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Envelope::Legacy(env) => serde_json::to_vec_pretty(env)?,
            Envelope::Classical(env) => serde_json::to_vec_pretty(env)?,
            Envelope::Hybrid(env) => serde_json::to_vec_pretty(env)?,
        };
        Ok(bytes)
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Legacy(_) => EnvelopeKind::Legacy,
            Envelope::Classical(_) => EnvelopeKind::Classical,
            Envelope::Hybrid(_) => EnvelopeKind::Hybrid,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Envelope::Legacy(env) => env.version.unwrap_or(LEGACY_VERSION),
            Envelope::Classical(env) => env.version,
            Envelope::Hybrid(env) => env.version,
        }
    }

    pub fn algorithm(&self) -> &str {
        match self {
            Envelope::Legacy(_) => LEGACY_ALGORITHM,
            Envelope::Classical(env) => &env.algorithm,
            Envelope::Hybrid(env) => &env.algorithm,
        }
    }
}

pub(crate) fn encode(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub(crate) fn decode(field: &'static str, value: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(value)
        .map_err(|e| StoreError::MalformedEnvelope(format!("{field}: {e}")))
}

pub(crate) fn decode_key(value: &str) -> Result<Vec<u8>> {
    Ok(general_purpose::STANDARD.decode(value)?)
}

/// Decode a field that must be exactly `N` bytes.
pub(crate) fn decode_array<const N: usize>(field: &'static str, value: &str) -> Result<[u8; N]> {
    let bytes = decode(field, value)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| {
        StoreError::MalformedEnvelope(format!("{field}: expected {N} bytes, got {len}"))
    })
}

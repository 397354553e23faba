//! Key resolution and the ML-KEM keypair lifecycle.

use crate::aead::{self, ClassicalKey};
use crate::audit::{self, AuditEvent, AuditSink};
use crate::config::EncryptionConfig;
use crate::envelope::{self, Envelope, EnvelopeKind, KEM_ALGORITHM};
use crate::error::{Result, StoreError};
use crate::hybrid::PqKeyPair;
use crate::{kdf, legacy, lock, machine, paths, storage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::{Zeroize, Zeroizing};

/// Where the classical key came from. Listed strongest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    Environment,
    File,
    Machine,
}

impl KeySource {
    pub fn as_str(self) -> &'static str {
        match self {
            KeySource::Environment => "environment",
            KeySource::File => "file",
            KeySource::Machine => "machine",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub key: ClassicalKey,
    pub source: KeySource,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKeyPair {
    algorithm: String,
    public_key: String,
    secret_key: String,
    created_at: DateTime<Utc>,
}

impl Drop for StoredKeyPair {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

pub struct KeyManager {
    config: EncryptionConfig,
    audit: Arc<dyn AuditSink>,
}

impl KeyManager {
    pub fn new(config: EncryptionConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self { config, audit }
    }

    /// First usable source wins: explicit key, key file, machine-derived.
    /// A source that is present but invalid is logged and skipped. `None`
    /// means encryption is off for this process.
    pub fn resolve_classical_key(&self) -> Option<ResolvedKey> {
        if !self.config.enabled {
            return None;
        }

        if let Some(encoded) = &self.config.key {
            match ClassicalKey::from_base64("environment key", encoded) {
                Ok(key) => {
                    return Some(ResolvedKey {
                        key,
                        source: KeySource::Environment,
                    })
                }
                Err(e) => warn!("ignoring configured encryption key: {e}"),
            }
        }

        if let Some(path) = &self.config.key_file {
            match read_key_file(path) {
                Ok(key) => {
                    return Some(ResolvedKey {
                        key,
                        source: KeySource::File,
                    })
                }
                Err(e) => warn!(path = %path.display(), "ignoring key file: {e}"),
            }
        }

        if self.config.allow_machine_key {
            warn!(
                "using machine-derived encryption key; this only obscures data from casual \
                 readers. Set STRONGBOX_ENCRYPTION_KEY for real protection"
            );
            self.audit.record(&AuditEvent::MachineKeyInUse);
            let key = kdf::machine_key(&machine_fingerprint(), self.config.pbkdf2_iterations);
            return Some(ResolvedKey {
                key,
                source: KeySource::Machine,
            });
        }

        None
    }

    pub fn pq_keypair_path(&self) -> PathBuf {
        self.config.pq_keypair_path()
    }

    /// Load the keypair from disk, generating and persisting one on first
    /// use. A keypair found in the legacy format is rewritten as v2.
    pub fn load_or_generate_pq_keypair(&self, key: &ClassicalKey) -> Result<PqKeyPair> {
        let logical = self.pq_keypair_path();
        let stored = stored_path(&logical);

        if self.config.read_only {
            let bytes = storage::read_if_exists(&stored)?.ok_or(StoreError::NoKeyAvailable(
                "no ML-KEM keypair on disk and the store is read-only",
            ))?;
            let (pair, _) = self.decode_keypair(&bytes, key)?;
            return Ok(pair);
        }

        lock::with_lock(&logical, &self.config.lock_options(), |guard| {
            audit::note_reclaimed(guard, self.audit.as_ref());
            match storage::read_if_exists(&stored)? {
                Some(bytes) => {
                    let (pair, kind) = self.decode_keypair(&bytes, key)?;
                    if kind == EnvelopeKind::Legacy {
                        write_keypair(&stored, &pair, key)?;
                        info!(path = %stored.display(), "migrated ML-KEM keypair to v2 envelope");
                        self.audit.record(&AuditEvent::PqKeysMigrated { path: stored.clone() });
                    } else {
                        self.audit.record(&AuditEvent::PqKeysLoaded { path: stored.clone() });
                    }
                    Ok(pair)
                }
                None => {
                    let pair = PqKeyPair::generate()?;
                    write_keypair(&stored, &pair, key)?;
                    info!(path = %stored.display(), "generated ML-KEM-768 keypair");
                    self.audit.record(&AuditEvent::PqKeysGenerated { path: stored.clone() });
                    Ok(pair)
                }
            }
        })
    }

    /// Replace the keypair unconditionally. Anything sealed to the old
    /// public key becomes unreadable.
    pub fn reset_pq_keypair(&self, key: &ClassicalKey) -> Result<PqKeyPair> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        let logical = self.pq_keypair_path();
        let stored = stored_path(&logical);
        lock::with_lock(&logical, &self.config.lock_options(), |guard| {
            audit::note_reclaimed(guard, self.audit.as_ref());
            let pair = PqKeyPair::generate()?;
            write_keypair(&stored, &pair, key)?;
            warn!(
                path = %stored.display(),
                "ML-KEM keypair reset; existing .pqenc files can no longer be decrypted"
            );
            self.audit.record(&AuditEvent::PqKeysReset { path: stored.clone() });
            Ok(pair)
        })
    }

    fn decode_keypair(&self, bytes: &[u8], key: &ClassicalKey) -> Result<(PqKeyPair, EnvelopeKind)> {
        let env = Envelope::from_slice(bytes)?;
        let plaintext = match env.kind() {
            EnvelopeKind::Classical => aead::decrypt_classical(&env, key)?,
            EnvelopeKind::Legacy => legacy::decrypt_legacy(&env, key, None)?,
            EnvelopeKind::Hybrid => return Err(StoreError::UnsupportedVersion(env.version())),
        };
        let stored: StoredKeyPair = serde_json::from_slice(&plaintext)?;
        if stored.algorithm != KEM_ALGORITHM {
            return Err(StoreError::UnsupportedAlgorithm(stored.algorithm.clone()));
        }
        let public_key = envelope::decode_key(&stored.public_key)?;
        let secret_key = Zeroizing::new(envelope::decode_key(&stored.secret_key)?);
        Ok((PqKeyPair::from_bytes(&public_key, &secret_key)?, env.kind()))
    }
}

/// Host fingerprint that seeds the machine-derived key.
pub fn machine_fingerprint() -> String {
    machine::fingerprint()
}

/// A fresh random key in the form `STRONGBOX_ENCRYPTION_KEY` expects.
pub fn generate_key() -> String {
    ClassicalKey::generate().to_base64()
}

fn stored_path(logical: &Path) -> PathBuf {
    paths::with_suffix(logical, ".enc")
}

fn read_key_file(path: &Path) -> Result<ClassicalKey> {
    let contents = Zeroizing::new(fs::read_to_string(path)?);
    ClassicalKey::from_base64("key file", &contents)
}

fn write_keypair(stored: &Path, pair: &PqKeyPair, key: &ClassicalKey) -> Result<()> {
    let record = StoredKeyPair {
        algorithm: KEM_ALGORITHM.to_string(),
        public_key: envelope::encode(pair.public_key()),
        secret_key: envelope::encode(pair.secret_key()),
        created_at: Utc::now(),
    };
    let plaintext = Zeroizing::new(serde_json::to_vec(&record)?);
    let env = aead::encrypt_classical(&plaintext, key)?;
    storage::write_atomic(stored, &env.to_vec()?)?;
    Ok(())
}

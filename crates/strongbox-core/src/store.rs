//! The public save/load/delete/exists surface.
//!
//! A logical file `X` is stored as exactly one of `X.pqenc` (hybrid v3),
//! `X.enc` (classical v2) or `X` (plaintext). Every mutating call on `X`
//! runs under the cross-process lock on `X`, and every successful save
//! removes the representations it did not write.

use crate::aead::{self, ClassicalKey};
use crate::audit::{self, AuditEvent, AuditSink, TracingAuditSink};
use crate::config::EncryptionConfig;
use crate::envelope::{Envelope, EnvelopeKind, AEAD_ALGORITHM, KEM_ALGORITHM};
use crate::error::{Result, StoreError};
use crate::hybrid::{self, PqKeyPair};
use crate::keys::{KeyManager, KeySource, ResolvedKey};
use crate::lock::{self, LockOptions};
use crate::{legacy, paths, storage};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// On-disk representation of a logical file, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Hybrid,
    Classical,
    Plaintext,
}

impl Variant {
    /// Probe order for `load`.
    pub const ALL: [Variant; 3] = [Variant::Hybrid, Variant::Classical, Variant::Plaintext];

    pub fn suffix(self) -> &'static str {
        match self {
            Variant::Hybrid => ".pqenc",
            Variant::Classical => ".enc",
            Variant::Plaintext => "",
        }
    }

    pub fn path_for(self, logical: &Path) -> PathBuf {
        paths::with_suffix(logical, self.suffix())
    }

    fn strength(self) -> u8 {
        match self {
            Variant::Hybrid => 2,
            Variant::Classical => 1,
            Variant::Plaintext => 0,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Variant::Hybrid => "hybrid",
            Variant::Classical => "classical",
            Variant::Plaintext => "plaintext",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncryptionStatus {
    pub enabled: bool,
    pub algorithm: Option<&'static str>,
    pub key_source: Option<KeySource>,
    pub pq_enabled: bool,
    pub pq_algorithm: Option<&'static str>,
    pub read_only: bool,
}

impl fmt::Display for EncryptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.enabled {
            return write!(f, "encryption disabled (plaintext storage)");
        }
        write!(f, "{}", self.algorithm.unwrap_or("none"))?;
        if let Some(pq) = self.pq_algorithm {
            write!(f, " + {pq}")?;
        }
        if let Some(source) = self.key_source {
            write!(f, ", key from {}", source.as_str())?;
        }
        if self.read_only {
            write!(f, ", read-only")?;
        }
        Ok(())
    }
}

/// What a single probe found at one candidate path.
enum Probe {
    Missing,
    Found(Variant, Vec<u8>),
}

struct Inner {
    config: EncryptionConfig,
    keys: KeyManager,
    audit: Arc<dyn AuditSink>,
    classical: Option<ResolvedKey>,
    pq: RwLock<Option<PqKeyPair>>,
}

/// Encrypted state store. Cheap to clone; clones share keys and audit sink.
#[derive(Clone)]
pub struct SecureStore {
    inner: Arc<Inner>,
    lock_options: LockOptions,
}

impl fmt::Debug for SecureStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureStore")
            .field("status", &self.status())
            .field("lock_options", &self.lock_options)
            .finish()
    }
}

impl SecureStore {
    pub fn open(config: EncryptionConfig) -> Result<Self> {
        Self::open_with_audit(config, Arc::new(TracingAuditSink))
    }

    /// Resolve keys once and fix the store's capabilities for its lifetime.
    /// A PQ keypair that cannot be loaded downgrades the store to classical
    /// mode; a lock timeout on the keypair file is returned as an error.
    pub fn open_with_audit(config: EncryptionConfig, audit: Arc<dyn AuditSink>) -> Result<Self> {
        let keys = KeyManager::new(config.clone(), audit.clone());
        let classical = keys.resolve_classical_key();

        let pq = match &classical {
            Some(resolved) if config.pq_enabled => {
                match keys.load_or_generate_pq_keypair(&resolved.key) {
                    Ok(pair) => Some(pair),
                    Err(e @ StoreError::LockTimeout { .. }) => return Err(e),
                    Err(e) => {
                        warn!("post-quantum mode unavailable, continuing with classical encryption: {e}");
                        audit.record(&AuditEvent::PqUnavailable { reason: e.to_string() });
                        None
                    }
                }
            }
            _ => None,
        };

        match &classical {
            Some(resolved) => audit.record(&AuditEvent::EncryptionInit {
                algorithm: AEAD_ALGORITHM.to_string(),
                key_source: Some(resolved.source),
                pq_enabled: pq.is_some(),
            }),
            None => {
                let reason = if config.enabled {
                    "no encryption key available"
                } else {
                    "disabled by configuration"
                };
                warn!("encryption disabled: {reason}; state will be stored in plaintext");
                audit.record(&AuditEvent::EncryptionDisabled {
                    reason: reason.to_string(),
                });
            }
        }

        let lock_options = config.lock_options();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                keys,
                audit,
                classical,
                pq: RwLock::new(pq),
            }),
            lock_options,
        })
    }

    /// A handle on the same store that waits with different patience, e.g.
    /// [`LockOptions::interactive_auth`] around a long login flow.
    pub fn with_lock_options(&self, lock_options: LockOptions) -> Self {
        Self {
            inner: self.inner.clone(),
            lock_options,
        }
    }

    pub fn lock_options(&self) -> &LockOptions {
        &self.lock_options
    }

    pub fn status(&self) -> EncryptionStatus {
        let enabled = self.inner.classical.is_some();
        let pq_enabled = self.inner.pq.read().is_some();
        EncryptionStatus {
            enabled,
            algorithm: enabled.then_some(AEAD_ALGORITHM),
            key_source: self.inner.classical.as_ref().map(|k| k.source),
            pq_enabled,
            pq_algorithm: pq_enabled.then_some(KEM_ALGORITHM),
            read_only: self.inner.config.read_only,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
        let path = path.as_ref();
        if self.inner.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        self.locked(path, || self.write_locked(path, data).map(|_| ()))
    }

    /// `Ok(None)` means nothing is stored under `path`.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Option<Vec<u8>>> {
        let path = path.as_ref();
        if self.inner.config.read_only {
            return self.read_locked(path, false);
        }
        self.locked(path, || self.read_locked(path, true))
    }

    /// Remove every representation of `path`. Returns whether any existed.
    pub fn delete(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        if self.inner.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        self.locked(path, || {
            let mut removed = false;
            for variant in Variant::ALL {
                removed |= storage::remove_if_exists(&variant.path_for(path))?;
            }
            if removed {
                debug!(path = %path.display(), "deleted");
            }
            Ok(removed)
        })
    }

    /// Unlocked; the answer can be out of date by the time it is used.
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        Variant::ALL.iter().any(|v| v.path_for(path).exists())
    }

    pub fn save_json<T: Serialize>(&self, path: impl AsRef<Path>, value: &T) -> Result<()> {
        let bytes = Zeroizing::new(serde_json::to_vec(value)?);
        self.save(path, &bytes)
    }

    pub fn load_json<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> Result<Option<T>> {
        match self.load(path)? {
            Some(bytes) => {
                let bytes = Zeroizing::new(bytes);
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            None => Ok(None),
        }
    }

    /// Generate a new ML-KEM keypair and switch this store to it. Existing
    /// `.pqenc` files sealed to the old keypair become unreadable.
    pub fn reset_pq_keys(&self) -> Result<()> {
        let resolved = self.classical()?;
        let pair = self.inner.keys.reset_pq_keypair(&resolved.key)?;
        *self.inner.pq.write() = Some(pair);
        Ok(())
    }

    /// Which representation a save would write right now.
    pub fn preferred_variant(&self) -> Variant {
        if self.inner.classical.is_none() {
            Variant::Plaintext
        } else if self.inner.pq.read().is_some() {
            Variant::Hybrid
        } else {
            Variant::Classical
        }
    }

    /// Which representation of `path` is currently on disk, if any.
    pub fn stored_variant(&self, path: impl AsRef<Path>) -> Option<Variant> {
        let path = path.as_ref();
        Variant::ALL.into_iter().find(|v| v.path_for(path).exists())
    }

    fn locked<T>(&self, path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
        lock::with_lock(path, &self.lock_options, |guard| {
            audit::note_reclaimed(guard, self.inner.audit.as_ref());
            f()
        })
    }

    fn classical(&self) -> Result<&ResolvedKey> {
        self.inner
            .classical
            .as_ref()
            .ok_or(StoreError::NoKeyAvailable("encryption is disabled"))
    }

    /// Caller holds the lock on `path`.
    fn write_locked(&self, path: &Path, data: &[u8]) -> Result<Variant> {
        let variant = self.preferred_variant();
        let bytes = match variant {
            Variant::Hybrid => {
                let pq = self.inner.pq.read();
                let pair = pq
                    .as_ref()
                    .ok_or(StoreError::NoKeyAvailable("ML-KEM keypair not loaded"))?;
                hybrid::encrypt_pq(data, pair.public_key())?.to_vec()?
            }
            Variant::Classical => aead::encrypt_classical(data, &self.classical()?.key)?.to_vec()?,
            Variant::Plaintext => {
                if self.inner.config.enabled {
                    warn!(path = %path.display(), "no encryption key; writing plaintext");
                    self.inner.audit.record(&AuditEvent::PlaintextFallback {
                        path: path.to_path_buf(),
                    });
                }
                data.to_vec()
            }
        };

        storage::write_atomic(&variant.path_for(path), &bytes)?;
        self.remove_siblings(path, variant)?;
        Ok(variant)
    }

    /// Removes every representation of `path` except `keep`.
    fn remove_siblings(&self, path: &Path, keep: Variant) -> Result<()> {
        for other in Variant::ALL.into_iter().filter(|v| *v != keep) {
            if storage::remove_if_exists(&other.path_for(path))? {
                debug!(path = %path.display(), removed = other.label(), "removed superseded variant");
            }
        }
        Ok(())
    }

    fn probe(&self, path: &Path) -> Result<Probe> {
        for variant in Variant::ALL {
            if let Some(bytes) = storage::read_if_exists(&variant.path_for(path))? {
                return Ok(Probe::Found(variant, bytes));
            }
        }
        Ok(Probe::Missing)
    }

    /// Caller holds the lock on `path` unless `write_back` is false.
    fn read_locked(&self, path: &Path, write_back: bool) -> Result<Option<Vec<u8>>> {
        let (variant, bytes) = match self.probe(path)? {
            Probe::Missing => return Ok(None),
            Probe::Found(variant, bytes) => (variant, bytes),
        };

        let (data, found, is_legacy) = match variant {
            Variant::Plaintext => (Zeroizing::new(bytes), Variant::Plaintext, false),
            Variant::Hybrid | Variant::Classical => {
                let file = variant.path_for(path);
                match self.decrypt(&bytes) {
                    Ok(opened) => opened,
                    Err(e) => {
                        error!(path = %file.display(), "decryption failed: {e}");
                        self.inner.audit.record(&AuditEvent::DecryptionFailed {
                            path: file,
                            error: e.to_string(),
                        });
                        return Err(e);
                    }
                }
            }
        };

        let target = self.preferred_variant();
        let upgrade = is_legacy || found != variant || found.strength() < target.strength();
        if upgrade && write_back {
            let from = if is_legacy { "legacy" } else { found.label() };
            match self.write_locked(path, &data) {
                Ok(to) => {
                    info!(path = %path.display(), from, to = to.label(), "migrated stored format");
                    self.inner.audit.record(&AuditEvent::FormatMigrated {
                        path: path.to_path_buf(),
                        from: from.to_string(),
                        to: to.label().to_string(),
                    });
                }
                Err(e) => warn!(path = %path.display(), from, "format upgrade write-back failed: {e}"),
            }
        } else if write_back {
            // Probing is strongest first, so anything left over is weaker.
            if let Err(e) = self.remove_siblings(path, variant) {
                warn!(path = %path.display(), "could not remove leftover variants: {e}");
            }
        }

        Ok(Some(data.to_vec()))
    }

    /// Returns the plaintext, the variant its envelope belongs to, and
    /// whether it was in the legacy format.
    fn decrypt(&self, bytes: &[u8]) -> Result<(Zeroizing<Vec<u8>>, Variant, bool)> {
        let env = Envelope::from_slice(bytes)?;
        match env.kind() {
            EnvelopeKind::Hybrid => {
                let pq = self.inner.pq.read();
                let pair = pq.as_ref().ok_or(StoreError::NoKeyAvailable(
                    "hybrid envelope found but post-quantum mode is not active",
                ))?;
                Ok((hybrid::decrypt_pq(&env, pair.secret_key())?, Variant::Hybrid, false))
            }
            EnvelopeKind::Classical => {
                let key: &ClassicalKey = &self.classical()?.key;
                Ok((aead::decrypt_classical(&env, key)?, Variant::Classical, false))
            }
            EnvelopeKind::Legacy => {
                let key = &self.classical()?.key;
                let pq = self.inner.pq.read();
                let secret = pq.as_ref().map(PqKeyPair::secret_key);
                let data = legacy::decrypt_legacy(&env, key, secret)?;
                let found = if secret.is_some() {
                    Variant::Hybrid
                } else {
                    Variant::Classical
                };
                Ok((data, found, true))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::keys::generate_key;
    use crate::legacy::fixtures::{seal_legacy, seal_legacy_hybrid};
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn config(dir: &TempDir, pq: bool) -> EncryptionConfig {
        EncryptionConfig {
            key: Some(generate_key()),
            pq_enabled: pq,
            key_dir: Some(dir.path().join("keys")),
            pbkdf2_iterations: 10,
            lock_timeout_ms: 2_000,
            lock_retry_ms: 5,
            ..Default::default()
        }
    }

    fn open(cfg: EncryptionConfig) -> (SecureStore, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let store = SecureStore::open_with_audit(cfg, sink.clone()).unwrap();
        (store, sink)
    }

    #[test]
    fn status_reflects_capabilities() {
        let dir = tempdir().unwrap();
        let (store, sink) = open(config(&dir, true));
        let status = store.status();
        assert!(status.enabled && status.pq_enabled);
        assert_eq!(status.key_source, Some(KeySource::Environment));
        assert_eq!(status.pq_algorithm, Some("ML-KEM-768"));
        assert_eq!(store.preferred_variant(), Variant::Hybrid);
        assert_eq!(
            status.to_string(),
            "chacha20-poly1305 + ML-KEM-768, key from environment"
        );
        assert_eq!(sink.event_types(), vec!["pq_keys_generated", "encryption_init"]);
    }

    #[test]
    fn disabled_store_writes_plaintext_quietly() {
        let dir = tempdir().unwrap();
        let (store, sink) = open(EncryptionConfig {
            enabled: false,
            ..config(&dir, true)
        });
        let path = dir.path().join("state");
        store.save(&path, b"{\"a\":1}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"a\":1}");
        assert_eq!(store.stored_variant(&path), Some(Variant::Plaintext));
        assert_eq!(sink.event_types(), vec!["encryption_disabled"]);
    }

    #[test]
    fn missing_key_falls_back_to_plaintext_with_warning() {
        let dir = tempdir().unwrap();
        let (store, sink) = open(EncryptionConfig {
            key: None,
            allow_machine_key: false,
            ..config(&dir, true)
        });
        let path = dir.path().join("state");
        store.save(&path, b"data").unwrap();
        assert_eq!(store.load(&path).unwrap().as_deref(), Some(&b"data"[..]));
        assert!(sink.event_types().contains(&"plaintext_fallback"));
    }

    #[test]
    fn classical_file_is_upgraded_on_read() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir, false);
        let path = dir.path().join("state");
        let (classical, _) = open(cfg.clone());
        classical.save(&path, b"counter=3").unwrap();
        assert_eq!(classical.stored_variant(&path), Some(Variant::Classical));

        cfg.pq_enabled = true;
        let (hybrid, sink) = open(cfg);
        assert_eq!(hybrid.load(&path).unwrap().as_deref(), Some(&b"counter=3"[..]));
        assert_eq!(hybrid.stored_variant(&path), Some(Variant::Hybrid));
        assert!(!Variant::Classical.path_for(&path).exists());
        assert!(sink.event_types().contains(&"format_migrated"));

        // upgraded once; a second read is not a migration
        sink.clear();
        hybrid.load(&path).unwrap();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn plaintext_is_encrypted_on_read() {
        let dir = tempdir().unwrap();
        let (store, _) = open(config(&dir, false));
        let path = dir.path().join("state");
        fs::write(&path, b"{\"old\":true}").unwrap();
        assert_eq!(store.load(&path).unwrap().as_deref(), Some(&b"{\"old\":true}"[..]));
        assert!(!path.exists());
        assert_eq!(store.stored_variant(&path), Some(Variant::Classical));
    }

    #[test]
    fn leftover_plaintext_sibling_is_removed_on_load() {
        let dir = tempdir().unwrap();
        let (store, _) = open(config(&dir, false));
        let path = dir.path().join("state");
        store.save(&path, b"sealed").unwrap();
        // a save interrupted between rename and cleanup
        fs::write(&path, b"stale plaintext").unwrap();

        assert_eq!(store.load(&path).unwrap().as_deref(), Some(&b"sealed"[..]));
        assert!(!path.exists());
        assert!(Variant::Classical.path_for(&path).exists());
        assert!(!Variant::Hybrid.path_for(&path).exists());
    }

    #[test]
    fn legacy_classical_file_is_migrated() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir, false);
        let key = ClassicalKey::from_base64("test", cfg.key.as_deref().unwrap()).unwrap();
        let (store, _) = open(cfg);
        let path = dir.path().join("state");
        let legacy = seal_legacy(b"old session", key.as_bytes(), 12);
        fs::write(Variant::Classical.path_for(&path), legacy.to_vec().unwrap()).unwrap();

        assert_eq!(store.load(&path).unwrap().as_deref(), Some(&b"old session"[..]));
        let rewritten = Envelope::from_slice(&fs::read(Variant::Classical.path_for(&path)).unwrap()).unwrap();
        assert_eq!(rewritten.kind(), EnvelopeKind::Classical);
    }

    #[test]
    fn legacy_hybrid_file_is_migrated() {
        let dir = tempdir().unwrap();
        let (store, _) = open(config(&dir, true));
        let path = dir.path().join("state");
        let public_key = store.inner.pq.read().as_ref().unwrap().public_key().to_vec();
        let legacy = seal_legacy_hybrid(b"pq-era", &public_key);
        fs::write(Variant::Hybrid.path_for(&path), legacy.to_vec().unwrap()).unwrap();

        assert_eq!(store.load(&path).unwrap().as_deref(), Some(&b"pq-era"[..]));
        let rewritten = Envelope::from_slice(&fs::read(Variant::Hybrid.path_for(&path)).unwrap()).unwrap();
        assert_eq!(rewritten.kind(), EnvelopeKind::Hybrid);
    }

    #[test]
    fn stronger_variant_without_key_is_not_skipped() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir, true);
        let path = dir.path().join("state");
        let (hybrid, _) = open(cfg.clone());
        hybrid.save(&path, b"sealed").unwrap();
        fs::write(&path, b"decoy").unwrap();

        cfg.pq_enabled = false;
        let (classical, _) = open(cfg);
        assert!(matches!(classical.load(&path), Err(StoreError::NoKeyAvailable(_))));
    }

    #[test]
    fn tampered_file_fails_and_is_audited() {
        let dir = tempdir().unwrap();
        let (store, sink) = open(config(&dir, false));
        let path = dir.path().join("state");
        store.save(&path, b"secret").unwrap();
        let file = Variant::Classical.path_for(&path);
        let mut env: serde_json::Value = serde_json::from_slice(&fs::read(&file).unwrap()).unwrap();
        env["nonce"] = serde_json::Value::String(crate::envelope::encode(&[0u8; 12]));
        fs::write(&file, serde_json::to_vec(&env).unwrap()).unwrap();

        assert!(matches!(store.load(&path), Err(StoreError::AuthenticationFailed)));
        assert!(file.exists());
        assert!(sink.event_types().contains(&"decryption_failed"));
    }

    #[test]
    fn read_only_reads_without_write_back() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir, true);
        let path = dir.path().join("state");
        fs::write(&path, b"plain").unwrap();

        let (ro, _) = open(EncryptionConfig {
            read_only: true,
            ..cfg
        });
        // no keypair was ever generated, so read-only cannot enable PQ
        assert!(!ro.status().pq_enabled);
        assert_eq!(ro.load(&path).unwrap().as_deref(), Some(&b"plain"[..]));
        assert_eq!(ro.stored_variant(&path), Some(Variant::Plaintext));
        assert!(matches!(ro.save(&path, b"x"), Err(StoreError::ReadOnly)));
        assert!(matches!(ro.delete(&path), Err(StoreError::ReadOnly)));
    }

    #[test]
    fn reset_pq_keys_orphans_old_files() {
        let dir = tempdir().unwrap();
        let (store, _) = open(config(&dir, true));
        let path = dir.path().join("state");
        store.save(&path, b"before").unwrap();
        store.reset_pq_keys().unwrap();
        assert!(matches!(store.load(&path), Err(StoreError::AuthenticationFailed)));
        store.save(&path, b"after").unwrap();
        assert_eq!(store.load(&path).unwrap().as_deref(), Some(&b"after"[..]));
    }

    #[test]
    fn lock_options_override_shares_state() {
        let dir = tempdir().unwrap();
        let (store, _) = open(config(&dir, false));
        let patient = store.with_lock_options(LockOptions::interactive_auth());
        assert_eq!(patient.lock_options(), &LockOptions::interactive_auth());
        let path = dir.path().join("auth");
        patient.save(&path, b"token").unwrap();
        assert_eq!(store.load(&path).unwrap().as_deref(), Some(&b"token"[..]));
    }

    #[test]
    fn save_waits_for_held_lock_then_times_out() {
        let dir = tempdir().unwrap();
        let (store, _) = open(config(&dir, false));
        let path = dir.path().join("state");
        let _held = lock::acquire(&path, &LockOptions::default()).unwrap();
        let impatient = store.with_lock_options(LockOptions {
            timeout: std::time::Duration::from_millis(50),
            retry_interval: std::time::Duration::from_millis(5),
            ..LockOptions::default()
        });
        assert!(matches!(
            impatient.save(&path, b"x"),
            Err(StoreError::LockTimeout { .. })
        ));
        assert!(!store.exists(&path));
    }
}

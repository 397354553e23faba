use crate::kdf::DEFAULT_PBKDF2_ITERATIONS;
use crate::lock::{LockOptions, DEFAULT_RETRY_INTERVAL, DEFAULT_STALE_THRESHOLD, DEFAULT_TIMEOUT};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const ENV_ENCRYPTION: &str = "STRONGBOX_ENCRYPTION";
pub const ENV_KEY: &str = "STRONGBOX_ENCRYPTION_KEY";
pub const ENV_KEY_FILE: &str = "STRONGBOX_ENCRYPTION_KEY_FILE";
pub const ENV_ALLOW_MACHINE_KEY: &str = "STRONGBOX_ALLOW_MACHINE_KEY";
pub const ENV_PBKDF2_ITERATIONS: &str = "STRONGBOX_PBKDF2_ITERATIONS";
pub const ENV_PQ: &str = "STRONGBOX_PQ";
pub const ENV_READ_ONLY: &str = "STRONGBOX_READ_ONLY";
pub const ENV_KEY_DIR: &str = "STRONGBOX_KEY_DIR";
pub const ENV_LOCK_TIMEOUT_MS: &str = "STRONGBOX_LOCK_TIMEOUT_MS";
pub const ENV_LOCK_STALE_MS: &str = "STRONGBOX_LOCK_STALE_MS";

/// Fixed for the lifetime of a store; read once at construction.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// Base64 classical key. Takes precedence over `key_file`.
    pub key: Option<String>,
    pub key_file: Option<PathBuf>,
    pub allow_machine_key: bool,
    pub pbkdf2_iterations: u32,
    pub pq_enabled: bool,
    pub read_only: bool,
    /// Where the ML-KEM keypair lives. Defaults to the platform data dir.
    pub key_dir: Option<PathBuf>,
    pub lock_timeout_ms: u64,
    pub lock_retry_ms: u64,
    pub lock_stale_ms: u64,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key: None,
            key_file: None,
            allow_machine_key: true,
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            pq_enabled: true,
            read_only: false,
            key_dir: None,
            lock_timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            lock_retry_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            lock_stale_ms: DEFAULT_STALE_THRESHOLD.as_millis() as u64,
        }
    }
}

impl fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("enabled", &self.enabled)
            .field("key", &self.key.as_ref().map(|_| "[REDACTED]"))
            .field("key_file", &self.key_file)
            .field("allow_machine_key", &self.allow_machine_key)
            .field("pbkdf2_iterations", &self.pbkdf2_iterations)
            .field("pq_enabled", &self.pq_enabled)
            .field("read_only", &self.read_only)
            .field("key_dir", &self.key_dir)
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .field("lock_retry_ms", &self.lock_retry_ms)
            .field("lock_stale_ms", &self.lock_stale_ms)
            .finish()
    }
}

impl EncryptionConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset or empty variables keep
    /// their defaults; unparseable ones keep their defaults with a warning.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| get(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();
        Self {
            enabled: flag(ENV_ENCRYPTION, var(ENV_ENCRYPTION), defaults.enabled),
            key: var(ENV_KEY),
            key_file: var(ENV_KEY_FILE).map(PathBuf::from),
            allow_machine_key: flag(
                ENV_ALLOW_MACHINE_KEY,
                var(ENV_ALLOW_MACHINE_KEY),
                defaults.allow_machine_key,
            ),
            pbkdf2_iterations: number(
                ENV_PBKDF2_ITERATIONS,
                var(ENV_PBKDF2_ITERATIONS),
                defaults.pbkdf2_iterations,
            ),
            pq_enabled: flag(ENV_PQ, var(ENV_PQ), defaults.pq_enabled),
            read_only: flag(ENV_READ_ONLY, var(ENV_READ_ONLY), defaults.read_only),
            key_dir: var(ENV_KEY_DIR).map(PathBuf::from),
            lock_timeout_ms: number(ENV_LOCK_TIMEOUT_MS, var(ENV_LOCK_TIMEOUT_MS), defaults.lock_timeout_ms),
            lock_retry_ms: defaults.lock_retry_ms,
            lock_stale_ms: number(ENV_LOCK_STALE_MS, var(ENV_LOCK_STALE_MS), defaults.lock_stale_ms),
        }
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(self.lock_timeout_ms),
            retry_interval: Duration::from_millis(self.lock_retry_ms.max(1)),
            stale_threshold: Duration::from_millis(self.lock_stale_ms),
        }
    }

    pub fn key_dir(&self) -> PathBuf {
        self.key_dir
            .clone()
            .or_else(paths::data_dir)
            .unwrap_or_else(|| PathBuf::from(".strongbox"))
    }

    /// Logical path of the ML-KEM keypair (stored as `<path>.enc`).
    pub fn pq_keypair_path(&self) -> PathBuf {
        self.key_dir().join(paths::PQ_KEYPAIR_FILE)
    }
}

fn flag(name: &str, raw: Option<String>, default: bool) -> bool {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => default,
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        Some(other) => {
            warn!(var = name, value = other, "unrecognised boolean; using default {default}");
            default
        }
    }
}

fn number<T: FromStr + fmt::Display + Copy>(name: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(value) => value.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %value, "unparseable number; using default {default}");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> EncryptionConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EncryptionConfig::from_vars(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_when_nothing_set() {
        let cfg = from_map(&[]);
        assert_eq!(cfg, EncryptionConfig::default());
        assert!(cfg.enabled && cfg.pq_enabled && cfg.allow_machine_key);
        assert_eq!(cfg.pbkdf2_iterations, 100_000);
        assert_eq!(cfg.lock_options(), LockOptions::default());
    }

    #[test]
    fn recognised_variables_are_applied() {
        let cfg = from_map(&[
            (ENV_ENCRYPTION, "off"),
            (ENV_KEY, " c2VjcmV0 "),
            (ENV_KEY_FILE, "/etc/strongbox.key"),
            (ENV_ALLOW_MACHINE_KEY, "0"),
            (ENV_PBKDF2_ITERATIONS, "2000"),
            (ENV_PQ, "false"),
            (ENV_READ_ONLY, "yes"),
            (ENV_KEY_DIR, "/var/lib/strongbox"),
            (ENV_LOCK_TIMEOUT_MS, "600000"),
            (ENV_LOCK_STALE_MS, "720000"),
        ]);
        assert!(!cfg.enabled);
        assert_eq!(cfg.key.as_deref(), Some("c2VjcmV0"));
        assert_eq!(cfg.key_file, Some(PathBuf::from("/etc/strongbox.key")));
        assert!(!cfg.allow_machine_key);
        assert_eq!(cfg.pbkdf2_iterations, 2000);
        assert!(!cfg.pq_enabled);
        assert!(cfg.read_only);
        assert_eq!(cfg.pq_keypair_path(), PathBuf::from("/var/lib/strongbox/pq-keypair"));
        assert_eq!(cfg.lock_options().timeout, Duration::from_secs(600));
        assert_eq!(cfg.lock_options().stale_threshold, Duration::from_secs(720));
    }

    #[test]
    fn garbage_values_fall_back_to_defaults() {
        let cfg = from_map(&[(ENV_PQ, "maybe"), (ENV_PBKDF2_ITERATIONS, "lots"), (ENV_KEY, "  ")]);
        assert!(cfg.pq_enabled);
        assert_eq!(cfg.pbkdf2_iterations, DEFAULT_PBKDF2_ITERATIONS);
        assert!(cfg.key.is_none());
    }

    #[test]
    fn debug_redacts_key() {
        let cfg = EncryptionConfig {
            key: Some("super-secret".into()),
            ..Default::default()
        };
        assert!(!format!("{cfg:?}").contains("super-secret"));
    }

    #[test]
    fn deserializes_partial_json() {
        let cfg: EncryptionConfig = serde_json::from_str(r#"{"pqEnabled": false}"#).unwrap();
        assert!(!cfg.pq_enabled);
        assert!(cfg.enabled);
    }
}

//! strongbox-core: encrypted, lock-protected state files
//!
//! # Design principles
//! - NO custom crypto; ChaCha20-Poly1305, AES-GCM and ML-KEM-768 come from
//!   RustCrypto / FIPS 203 crates.
//! - Derived keys and secret keys are zeroized on drop.
//! - At most one on-disk representation per logical file.
//! - All mutation of a file happens under its cross-process lock.
//!
//! # Module layout
//! - `lock`         `O_EXCL` sidecar locks with stale reclamation
//! - `keys`         classical key resolution, ML-KEM keypair lifecycle
//! - `aead`         ChaCha20-Poly1305 envelope v2
//! - `hybrid`       ML-KEM-768 + ChaCha20-Poly1305 envelope v3
//! - `legacy`       read-only AES-256-GCM envelope v1
//! - `envelope`     on-disk JSON formats and detection
//! - `kdf`          PBKDF2 machine key, SHA-256 hybrid key
//! - `machine`      hostname, CPU model and machine fingerprint
//! - `paths`        variant suffixes and default key directory
//! - `storage`      atomic writes and removal
//! - `store`        `SecureStore` facade
//! - `async_store`  tokio adapter over the facade
//! - `audit`        security event sinks
//! - `config`       `EncryptionConfig` and environment surface
//! - `error`        unified error type

pub mod aead;
pub mod async_store;
pub mod audit;
pub mod config;
pub mod envelope;
pub mod error;
pub mod hybrid;
pub mod kdf;
pub mod keys;
pub mod legacy;
pub mod lock;
pub mod machine;
pub mod paths;
pub mod storage;
pub mod store;

pub use async_store::AsyncSecureStore;
pub use audit::{AuditEvent, AuditSink, JsonlAuditLog, MemoryAuditSink, TracingAuditSink};
pub use config::EncryptionConfig;
pub use error::{Result, StoreError};
pub use keys::{generate_key, KeySource};
pub use lock::{LockGuard, LockOptions};
pub use store::{EncryptionStatus, SecureStore, Variant};

//! Key derivation.
//!
//! `machine_key`: PBKDF2-HMAC-SHA256 over a hash of the host fingerprint.
//!   The salt is public and the inputs are guessable, so this key only
//!   keeps casual readers out of the state directory.
//!
//! `hybrid_key`: SHA-256 over `shared_secret || salt`, the per-message AEAD
//!   key for envelope v3.

use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::aead::{ClassicalKey, KEY_LEN};

pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;
pub const MACHINE_KEY_SALT: &[u8] = b"strongbox-machine-key-v1";

pub fn machine_key(fingerprint: &str, iterations: u32) -> ClassicalKey {
    let passphrase = Zeroizing::new(hex::encode(Sha256::digest(fingerprint.as_bytes())));
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(
        passphrase.as_bytes(),
        MACHINE_KEY_SALT,
        iterations.max(1),
        &mut key[..],
    );
    ClassicalKey::from_bytes(*key)
}

pub fn hybrid_key(shared_secret: &[u8], salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.update(salt);
    Zeroizing::new(hasher.finalize().into())
}

//! Classical authenticated encryption (envelope v2).
//!
//! ChaCha20-Poly1305 with a 96-bit random nonce and 128-bit tag. The cipher
//! runs in constant time in software, so hosts without AES hardware do not
//! leak key bits through cache timing.
//!
//! Key: 32 bytes. Nonce: 12 bytes (fresh per call). Salt: 32 random bytes,
//! carried for symmetry with v3 but not used to derive anything here.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::envelope::{self, ClassicalEnvelope, Envelope, AEAD_ALGORITHM, CLASSICAL_VERSION};
use crate::error::{Result, StoreError};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const SALT_LEN: usize = 32;
pub const TAG_LEN: usize = 16;

/// 32-byte symmetric key. Zeroized on drop, redacted in `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ClassicalKey([u8; KEY_LEN]);

impl ClassicalKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(origin: &'static str, bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| StoreError::InvalidKeyLength {
            origin,
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn from_base64(origin: &'static str, encoded: &str) -> Result<Self> {
        let decoded = Zeroizing::new(envelope::decode_key(encoded.trim())?);
        Self::from_slice(origin, &decoded)
    }

    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub fn to_base64(&self) -> String {
        envelope::encode(&self.0)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for ClassicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClassicalKey([REDACTED])")
    }
}

pub(crate) fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Returns `ciphertext || tag`.
pub(crate) fn seal(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| StoreError::AeadEncrypt)
}

pub(crate) fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    sealed: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.len() < TAG_LEN {
        return Err(StoreError::AuthenticationFailed);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| StoreError::AuthenticationFailed)?;
    Ok(Zeroizing::new(plaintext))
}

pub fn encrypt_classical(plaintext: &[u8], key: &ClassicalKey) -> Result<Envelope> {
    let nonce: [u8; NONCE_LEN] = random_bytes();
    let salt: [u8; SALT_LEN] = random_bytes();
    let ciphertext = seal(key.as_bytes(), &nonce, plaintext)?;
    Ok(Envelope::Classical(ClassicalEnvelope {
        version: CLASSICAL_VERSION,
        algorithm: AEAD_ALGORITHM.to_string(),
        nonce: envelope::encode(&nonce),
        salt: envelope::encode(&salt),
        ciphertext: envelope::encode(&ciphertext),
    }))
}

pub fn decrypt_classical(envelope: &Envelope, key: &ClassicalKey) -> Result<Zeroizing<Vec<u8>>> {
    let env = match envelope {
        Envelope::Classical(env) => env,
        other => return Err(StoreError::UnsupportedVersion(other.version())),
    };
    let nonce = envelope::decode_array::<NONCE_LEN>("nonce", &env.nonce)?;
    let sealed = envelope::decode("ciphertext", &env.ciphertext)?;
    open(key.as_bytes(), &nonce, &sealed)
}

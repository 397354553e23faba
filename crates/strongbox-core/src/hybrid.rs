//! Post-quantum hybrid encryption (envelope v3).
//!
//! ML-KEM-768 (FIPS 203) establishes a fresh 32-byte shared secret per call;
//! the AEAD key is `SHA256(shared_secret || salt)` with a fresh random salt, and
//! the payload is sealed with ChaCha20-Poly1305. Every encryption therefore
//! uses a distinct key and nonce even for identical plaintext.
//!
//! Derived keys live in `Zeroizing` buffers and are wiped when they go out
//! of scope.

use fips203::ml_kem_768;
use fips203::traits::{Decaps, Encaps, KeyGen, SerDes};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

use crate::aead::{self, NONCE_LEN, SALT_LEN};
use crate::envelope::{self, Envelope, HybridEnvelope, AEAD_ALGORITHM, HYBRID_VERSION, KEM_ALGORITHM};
use crate::error::{Result, StoreError};
use crate::kdf;

pub const PUBLIC_KEY_LEN: usize = 1184;
pub const SECRET_KEY_LEN: usize = 2400;
pub const CIPHERTEXT_LEN: usize = 1088;
pub const SHARED_SECRET_LEN: usize = 32;

/// ML-KEM-768 keypair. The secret half is wiped on drop.
#[derive(Clone)]
pub struct PqKeyPair {
    public_key: Vec<u8>,
    secret_key: Zeroizing<Vec<u8>>,
}

impl PqKeyPair {
    pub fn generate() -> Result<Self> {
        let (ek, dk) = ml_kem_768::KG::try_keygen().map_err(|e| StoreError::Kem(e.to_string()))?;
        let mut dk_bytes = dk.into_bytes();
        let pair = Self {
            public_key: ek.into_bytes().to_vec(),
            secret_key: Zeroizing::new(dk_bytes.to_vec()),
        };
        dk_bytes.zeroize();
        Ok(pair)
    }

    pub fn from_bytes(public_key: &[u8], secret_key: &[u8]) -> Result<Self> {
        if public_key.len() != PUBLIC_KEY_LEN {
            return Err(StoreError::InvalidKeyLength {
                origin: "ML-KEM public key",
                expected: PUBLIC_KEY_LEN,
                actual: public_key.len(),
            });
        }
        if secret_key.len() != SECRET_KEY_LEN {
            return Err(StoreError::InvalidKeyLength {
                origin: "ML-KEM secret key",
                expected: SECRET_KEY_LEN,
                actual: secret_key.len(),
            });
        }
        Ok(Self {
            public_key: public_key.to_vec(),
            secret_key: Zeroizing::new(secret_key.to_vec()),
        })
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn secret_key(&self) -> &[u8] {
        &self.secret_key
    }
}

impl fmt::Debug for PqKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PqKeyPair")
            .field("algorithm", &KEM_ALGORITHM)
            .field("public_key_len", &self.public_key.len())
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Returns `(encapsulated_key, shared_secret)`.
pub(crate) fn encapsulate(public_key: &[u8]) -> Result<(Vec<u8>, Zeroizing<[u8; SHARED_SECRET_LEN]>)> {
    let pk: [u8; PUBLIC_KEY_LEN] = public_key.try_into().map_err(|_| StoreError::InvalidKeyLength {
        origin: "ML-KEM public key",
        expected: PUBLIC_KEY_LEN,
        actual: public_key.len(),
    })?;
    let ek = ml_kem_768::EncapsKey::try_from_bytes(pk).map_err(|e| StoreError::Kem(e.to_string()))?;
    let (ss, ct) = ek.try_encaps().map_err(|e| StoreError::Kem(e.to_string()))?;
    Ok((ct.into_bytes().to_vec(), Zeroizing::new(ss.into_bytes())))
}

pub(crate) fn decapsulate(
    secret_key: &[u8],
    encapsulated_key: &[u8],
) -> Result<Zeroizing<[u8; SHARED_SECRET_LEN]>> {
    let mut sk: Zeroizing<[u8; SECRET_KEY_LEN]> = Zeroizing::new([0u8; SECRET_KEY_LEN]);
    if secret_key.len() != SECRET_KEY_LEN {
        return Err(StoreError::InvalidKeyLength {
            origin: "ML-KEM secret key",
            expected: SECRET_KEY_LEN,
            actual: secret_key.len(),
        });
    }
    sk.copy_from_slice(secret_key);
    let ct: [u8; CIPHERTEXT_LEN] = encapsulated_key.try_into().map_err(|_| {
        StoreError::MalformedEnvelope(format!(
            "encapsulatedKey: expected {CIPHERTEXT_LEN} bytes, got {}",
            encapsulated_key.len()
        ))
    })?;
    let dk = ml_kem_768::DecapsKey::try_from_bytes(*sk).map_err(|e| StoreError::Kem(e.to_string()))?;
    let ct = ml_kem_768::CipherText::try_from_bytes(ct).map_err(|e| StoreError::Kem(e.to_string()))?;
    let ss = dk.try_decaps(&ct).map_err(|e| StoreError::Kem(e.to_string()))?;
    Ok(Zeroizing::new(ss.into_bytes()))
}

pub fn encrypt_pq(plaintext: &[u8], recipient_public_key: &[u8]) -> Result<Envelope> {
    let (encapsulated_key, shared_secret) = encapsulate(recipient_public_key)?;
    let salt: [u8; SALT_LEN] = aead::random_bytes();
    let nonce: [u8; NONCE_LEN] = aead::random_bytes();
    let key = kdf::hybrid_key(shared_secret.as_slice(), &salt);
    let ciphertext = aead::seal(&key, &nonce, plaintext)?;
    Ok(Envelope::Hybrid(HybridEnvelope {
        version: HYBRID_VERSION,
        algorithm: AEAD_ALGORITHM.to_string(),
        pq_algorithm: KEM_ALGORITHM.to_string(),
        encapsulated_key: envelope::encode(&encapsulated_key),
        nonce: envelope::encode(&nonce),
        salt: envelope::encode(&salt),
        ciphertext: envelope::encode(&ciphertext),
    }))
}

pub fn decrypt_pq(envelope: &Envelope, recipient_secret_key: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let env = match envelope {
        Envelope::Hybrid(env) => env,
        other => return Err(StoreError::UnsupportedVersion(other.version())),
    };
    let encapsulated_key = envelope::decode("encapsulatedKey", &env.encapsulated_key)?;
    let nonce = envelope::decode_array::<NONCE_LEN>("nonce", &env.nonce)?;
    let salt = envelope::decode("salt", &env.salt)?;
    let sealed = envelope::decode("ciphertext", &env.ciphertext)?;

    let shared_secret = decapsulate(recipient_secret_key, &encapsulated_key)?;
    let key = kdf::hybrid_key(shared_secret.as_slice(), &salt);
    aead::open(&key, &nonce, &sealed)
}

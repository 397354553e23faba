//! Read path for the pre-versioned AES-256-GCM envelope.
//!
//! Nothing writes this format any more; it is decrypted once and the caller
//! re-saves the data in the current format.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{Aes256Gcm, AesGcm, Nonce};
use zeroize::Zeroizing;

use crate::aead::{ClassicalKey, KEY_LEN, TAG_LEN};
use crate::envelope::{self, Envelope};
use crate::error::{Result, StoreError};
use crate::{hybrid, kdf};

/// Some legacy writers used a 128-bit IV instead of the standard 96-bit one.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

pub fn decrypt_legacy(
    envelope: &Envelope,
    classical_key: &ClassicalKey,
    pq_secret_key: Option<&[u8]>,
) -> Result<Zeroizing<Vec<u8>>> {
    let env = match envelope {
        Envelope::Legacy(env) => env,
        other => return Err(StoreError::UnsupportedVersion(other.version())),
    };
    let iv = envelope::decode("iv", &env.iv)?;
    let tag = envelope::decode_array::<TAG_LEN>("tag", &env.tag)?;
    let mut sealed = envelope::decode("ciphertext", &env.ciphertext)?;
    sealed.extend_from_slice(&tag);

    let key: Zeroizing<[u8; KEY_LEN]> = match &env.encapsulated_key {
        Some(encapsulated) => {
            let secret = pq_secret_key
                .ok_or(StoreError::NoKeyAvailable("legacy hybrid envelope needs the ML-KEM secret key"))?;
            let encapsulated = envelope::decode("encapsulatedKey", encapsulated)?;
            let salt = match &env.salt {
                Some(salt) => envelope::decode("salt", salt)?,
                None => Vec::new(),
            };
            let shared_secret = hybrid::decapsulate(secret, &encapsulated)?;
            kdf::hybrid_key(shared_secret.as_slice(), &salt)
        }
        None => Zeroizing::new(*classical_key.as_bytes()),
    };

    let plaintext = match iv.len() {
        12 => Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|_| StoreError::AuthenticationFailed)?
            .decrypt(Nonce::from_slice(&iv), sealed.as_slice()),
        16 => Aes256Gcm16::new_from_slice(key.as_slice())
            .map_err(|_| StoreError::AuthenticationFailed)?
            .decrypt(aes_gcm::aead::generic_array::GenericArray::from_slice(&iv), sealed.as_slice()),
        other => {
            return Err(StoreError::MalformedEnvelope(format!(
                "iv: expected 12 or 16 bytes, got {other}"
            )))
        }
    }
    .map_err(|_| StoreError::AuthenticationFailed)?;
    Ok(Zeroizing::new(plaintext))
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::hybrid::PqKeyPair;

    #[test]
    fn decrypts_classical_legacy_with_either_iv_width() {
        let key = ClassicalKey::generate();
        for iv_len in [12, 16] {
            let env = seal_legacy(b"{\"session\":\"old\"}", key.as_bytes(), iv_len);
            let pt = decrypt_legacy(&env, &key, None).unwrap();
            assert_eq!(pt.as_slice(), b"{\"session\":\"old\"}");
        }
    }

    #[test]
    fn decrypts_legacy_hybrid_with_secret_key() {
        let key = ClassicalKey::generate();
        let pair = PqKeyPair::generate().unwrap();
        let env = seal_legacy_hybrid(b"hybrid-era data", pair.public_key());
        assert!(matches!(
            decrypt_legacy(&env, &key, None),
            Err(StoreError::NoKeyAvailable(_))
        ));
        let pt = decrypt_legacy(&env, &key, Some(pair.secret_key())).unwrap();
        assert_eq!(pt.as_slice(), b"hybrid-era data");
    }

    #[test]
    fn legacy_tag_mismatch_is_authentication_failure() {
        let key = ClassicalKey::generate();
        let mut env = seal_legacy(b"payload", key.as_bytes(), 12);
        if let Envelope::Legacy(l) = &mut env {
            let mut tag = envelope::decode("tag", &l.tag).unwrap();
            tag[3] ^= 0x10;
            l.tag = envelope::encode(&tag);
        }
        assert!(matches!(
            decrypt_legacy(&env, &key, None),
            Err(StoreError::AuthenticationFailed)
        ));
        assert!(matches!(
            decrypt_legacy(&env, &ClassicalKey::generate(), None),
            Err(StoreError::AuthenticationFailed)
        ));
    }

    #[test]
    fn current_formats_are_not_legacy() {
        let key = ClassicalKey::generate();
        let env = crate::aead::encrypt_classical(b"x", &key).unwrap();
        assert!(matches!(
            decrypt_legacy(&env, &key, None),
            Err(StoreError::UnsupportedVersion(2))
        ));
    }
}

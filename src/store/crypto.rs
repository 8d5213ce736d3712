//! Two-layer key wrapping for the encrypted store (§3, §4.2, §6).
//!
//! `K = SHA-256(sign(C))` wraps a random `K_db` under AES-256-GCM; `K_db` in
//! turn wraps the JSON-serialised model, also under AES-256-GCM. Both AEAD
//! operations use empty associated data, matching `database.py` exactly.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::credential::CredentialProvider;
use crate::error::StoreError;

/// 32-byte database encryption key, zeroised on drop (§3: "scoped to the
/// store's lifetime and zeroised on teardown").
#[derive(Clone, ZeroizeOnDrop)]
pub struct DbKey(pub(crate) [u8; 32]);

impl DbKey {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        DbKey(bytes)
    }
}

/// `nonce[12] || ciphertext`, the on-disk shape for both the wrapped `K_db`
/// file and the database blob.
pub struct SealedBlob {
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

impl SealedBlob {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() < 12 {
            return Err(StoreError::Crypto("sealed blob shorter than nonce".into()));
        }
        let nonce: [u8; 12] = bytes[..12].try_into().unwrap();
        Ok(SealedBlob {
            nonce,
            ciphertext: bytes[12..].to_vec(),
        })
    }
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<SealedBlob, StoreError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| StoreError::Crypto(e.to_string()))?;
    Ok(SealedBlob {
        nonce: nonce_bytes,
        ciphertext,
    })
}

fn unseal(key: &[u8; 32], blob: &SealedBlob) -> Result<Vec<u8>, StoreError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(&blob.nonce);
    cipher
        .decrypt(nonce, blob.ciphertext.as_ref())
        .map_err(|e| StoreError::Crypto(e.to_string()))
}

/// `K = SHA-256(sign(C))` (§3, §4.1).
pub fn derive_wrapping_key(
    credential: &dyn CredentialProvider,
    challenge: &[u8; 8],
) -> Result<[u8; 32], StoreError> {
    let signature = credential.sign(challenge).map_err(StoreError::Credential)?;
    let mut hasher = Sha256::new();
    hasher.update(&signature);
    Ok(hasher.finalize().into())
}

/// Wrap a freshly-generated `K_db` under `K`.
pub fn wrap_db_key(wrapping_key: &[u8; 32], db_key: &DbKey) -> Result<SealedBlob, StoreError> {
    seal(wrapping_key, &db_key.0)
}

/// Unwrap `K_db` from its sealed on-disk form.
pub fn unwrap_db_key(wrapping_key: &[u8; 32], blob: &SealedBlob) -> Result<DbKey, StoreError> {
    let mut plaintext = unseal(wrapping_key, blob)?;
    if plaintext.len() != 32 {
        plaintext.zeroize();
        return Err(StoreError::Crypto("unwrapped K_db has wrong length".into()));
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(DbKey(bytes))
}

/// Seal the JSON-serialised model under `K_db`.
pub fn seal_model(db_key: &DbKey, json: &[u8]) -> Result<SealedBlob, StoreError> {
    seal(&db_key.0, json)
}

/// Recover the JSON-serialised model from its sealed on-disk form.
pub fn unseal_model(db_key: &DbKey, blob: &SealedBlob) -> Result<Vec<u8>, StoreError> {
    unseal(&db_key.0, blob)
}

/// `hex16 = SHA-256(ascii(serial))[:16 hex chars]` (§6): the filename stem
/// derived from the identity's serial number. `serial` is expected to
/// already be the ASCII bytes of the certificate's decimal serial number
/// (see `credential::parse_identity`), hashed as-is — not re-encoded.
pub fn filename_stem(serial: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serial);
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_wrap_roundtrips() {
        let wrapping_key = [1u8; 32];
        let db_key = DbKey::random();
        let sealed = wrap_db_key(&wrapping_key, &db_key).unwrap();
        let unwrapped = unwrap_db_key(&wrapping_key, &sealed).unwrap();
        assert_eq!(unwrapped.0, db_key.0);
    }

    #[test]
    fn bit_flip_in_ciphertext_fails_auth() {
        let wrapping_key = [2u8; 32];
        let db_key = DbKey::random();
        let mut sealed = wrap_db_key(&wrapping_key, &db_key).unwrap();
        sealed.ciphertext[0] ^= 0x01;
        assert!(unwrap_db_key(&wrapping_key, &sealed).is_err());
    }

    #[test]
    fn model_blob_roundtrips() {
        let db_key = DbKey::random();
        let json = br#"{"contacts":{}}"#;
        let sealed = seal_model(&db_key, json).unwrap();
        let recovered = unseal_model(&db_key, &sealed).unwrap();
        assert_eq!(recovered, json);
    }

    #[test]
    fn filename_stem_is_stable_for_same_serial() {
        let serial = vec![0xde, 0xad, 0xbe, 0xef];
        assert_eq!(filename_stem(&serial), filename_stem(&serial));
        assert_eq!(filename_stem(&serial).len(), 16);
    }
}

//! Per-field authenticated encryption.
//!
//! Encryption is applied to a single encoded field's bytes, after that
//! field has been encoded but before the whole record is framed and
//! (optionally) compressed. Each ciphertext carries its own random nonce so
//! fields can be encrypted independently without a shared counter.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use rand::RngCore as _;

use super::error::SerializerError;

const NONCE_LEN: usize = 12;

pub struct FieldCrypto {
    cipher: Aes256Gcm,
}

impl FieldCrypto {
    pub fn new(key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SerializerError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| SerializerError::IntegrityError(format!("encrypt failed: {e}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a blob produced by `encrypt`. Any corruption (truncation, bit
    /// flip, wrong key) surfaces as `IntegrityError`, never silently.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, SerializerError> {
        if blob.len() < NONCE_LEN {
            return Err(SerializerError::IntegrityError(
                "ciphertext shorter than nonce".to_string(),
            ));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| SerializerError::IntegrityError(format!("decrypt failed: {e}")))
    }
}

/// A fresh random 32-byte key, for tests and first-time bootstrap.
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plaintext() {
        let crypto = FieldCrypto::new(&generate_key());
        let ciphertext = crypto.encrypt(b"hello world").unwrap();
        let plaintext = crypto.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, b"hello world");
    }

    #[test]
    fn distinct_encryptions_are_not_identical() {
        let crypto = FieldCrypto::new(&generate_key());
        let a = crypto.encrypt(b"same input").unwrap();
        let b = crypto.encrypt(b"same input").unwrap();
        assert_ne!(a, b, "nonces must differ between calls");
    }

    #[test]
    fn tampered_ciphertext_fails_integrity_check() {
        let crypto = FieldCrypto::new(&generate_key());
        let mut ciphertext = crypto.encrypt(b"hello world").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        let err = crypto.decrypt(&ciphertext).unwrap_err();
        assert!(matches!(err, SerializerError::IntegrityError(_)));
    }

    #[test]
    fn wrong_key_fails_integrity_check() {
        let a = FieldCrypto::new(&generate_key());
        let b = FieldCrypto::new(&generate_key());
        let ciphertext = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&ciphertext).is_err());
    }
}

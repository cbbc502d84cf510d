//! Secret-field encryption.
//!
//! Designated fields are encrypted with AES-256-GCM before a document is
//! journaled and decrypted on the read path. Ciphertexts are
//! self-contained: `base64(nonce || ciphertext || tag)`, so a collection
//! file can be moved between machines that share the key.
//!
//! Keys are derived from a user-supplied secret with HKDF-SHA256 and
//! zeroized on drop.

use crate::codec::get_path_mut;
use crate::error::{DbError, DbResult};
use crate::registry::Descriptor;
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde_json::Value;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Encryption key for secret fields.
///
/// The key is automatically zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey {
    bytes: [u8; KEY_SIZE],
}

impl CipherKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `CipherError` if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> DbResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(DbError::cipher(format!(
                "invalid key size: expected {KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Derives a key from a user secret using HKDF-SHA256.
    ///
    /// The salt should be unique per database and stored alongside it; the
    /// same secret and salt always derive the same key.
    pub fn derive_from_secret(secret: &[u8], salt: &[u8]) -> DbResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(salt), secret);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(b"jsonldb-field-key-v1", &mut bytes)
            .map_err(|_| DbError::cipher("HKDF expand failed"))?;
        Ok(Self { bytes })
    }

    /// Returns the raw key bytes. Do not log or persist the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Encrypts and decrypts secret field values.
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl FieldCipher {
    /// Creates a field cipher with the given key.
    #[must_use]
    pub fn new(key: &CipherKey) -> Self {
        // Infallible: CipherKey.bytes is always exactly the AES-256 key size.
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
        Self { cipher }
    }

    /// Encrypts one field value.
    ///
    /// Output is `base64(nonce || ciphertext || tag)`. A random nonce makes
    /// repeated encryptions of the same value produce different
    /// ciphertexts.
    pub fn encrypt_field(&self, plain: &str) -> DbResult<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plain.as_bytes())
            .map_err(|_| DbError::cipher("encryption error"))?;

        let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend(ciphertext);

        Ok(BASE64.encode(payload))
    }

    /// Decrypts a field value produced by [`encrypt_field`](Self::encrypt_field).
    ///
    /// # Errors
    ///
    /// Returns `CipherError` on malformed base64, truncated payloads,
    /// tampered ciphertext or a wrong key.
    pub fn decrypt_field(&self, encoded: &str) -> DbResult<String> {
        let payload = BASE64
            .decode(encoded)
            .map_err(|_| DbError::cipher("ciphertext is not valid base64"))?;

        if payload.len() < NONCE_SIZE + TAG_SIZE {
            return Err(DbError::cipher("ciphertext too short"));
        }

        let nonce = Nonce::from_slice(&payload[..NONCE_SIZE]);
        let plain = self
            .cipher
            .decrypt(nonce, &payload[NONCE_SIZE..])
            .map_err(|_| DbError::cipher("decryption error"))?;

        String::from_utf8(plain).map_err(|_| DbError::cipher("plaintext is not valid UTF-8"))
    }

    /// Encrypts every secret field of a document in place.
    ///
    /// Absent and null secret fields are left alone; a non-string value
    /// under a secret path is `InvalidDocument`.
    pub fn encrypt_document(&self, doc: &mut Value, descriptor: &Descriptor) -> DbResult<()> {
        for path in descriptor.secret_field_paths() {
            let Some(node) = get_path_mut(doc, path) else {
                continue;
            };
            match node {
                Value::Null => {}
                Value::String(plain) => {
                    *node = Value::String(self.encrypt_field(plain)?);
                }
                _ => {
                    return Err(DbError::invalid_document(format!(
                        "secret field {path:?} is not a string"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Decrypts every secret field of a document in place.
    pub fn decrypt_document(&self, doc: &mut Value, descriptor: &Descriptor) -> DbResult<()> {
        for path in descriptor.secret_field_paths() {
            let Some(node) = get_path_mut(doc, path) else {
                continue;
            };
            match node {
                Value::Null => {}
                Value::String(encoded) => {
                    *node = Value::String(self.decrypt_field(encoded)?);
                }
                _ => {
                    return Err(DbError::cipher(format!(
                        "secret field {path:?} is not a string at rest"
                    )))
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher")
            .field("cipher", &"Aes256Gcm")
            .finish()
    }
}

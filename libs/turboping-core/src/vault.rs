use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid vault key: {0}")]
    InvalidKey(String),
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed: wrong key or tampered ciphertext")]
    Decrypt,
}

/// Symmetric protection for proxy credentials at rest.
pub trait CredentialVault: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, VaultError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, VaultError>;
}

/// AES-256-GCM. Ciphertexts are `base64(nonce || ciphertext+tag)` with a
/// fresh random nonce per call.
#[derive(Clone)]
pub struct AesVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AesVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesVault(..)")
    }
}

impl AesVault {
    /// `key` is 32 bytes, base64 encoded.
    pub fn from_base64_key(key: &str) -> Result<Self, VaultError> {
        let bytes = STANDARD
            .decode(key.trim())
            .map_err(|e| VaultError::InvalidKey(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(VaultError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// A fresh random key in the format `from_base64_key` expects.
    pub fn generate_key() -> String {
        STANDARD.encode(Aes256Gcm::generate_key(OsRng))
    }
}

impl CredentialVault for AesVault {
    fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, VaultError> {
        let sealed = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| VaultError::Malformed(e.to_string()))?;
        if sealed.len() <= NONCE_LEN {
            return Err(VaultError::Malformed("shorter than a nonce".into()));
        }

        let (nonce, body) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| VaultError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|e| VaultError::Malformed(e.to_string()))
    }
}

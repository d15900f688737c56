//! Application secret keys.
//!
//! Stored secrets come in two shapes: 32 plaintext characters, or the hex
//! encoding of `nonce (12 bytes) || AES-256-GCM ciphertext` when the secret is
//! encrypted at rest. Anything that cannot be decoded never matches.

use aes_gcm::{
    Aes256Gcm,
    Nonce,
    aead::{
        Aead,
        AeadCore,
        KeyInit,
        OsRng,
    },
};
use thiserror::Error;
use tracing::warn;

/// Length of a plaintext secret key.
pub const PLAINTEXT_SECRET_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum SecretKeyError {
    #[error("encryption key must be 32 bytes of hex")]
    InvalidKey,
    #[error("stored secret is not valid hex: {0}")]
    Encoding(#[from] hex::FromHexError),
    #[error("stored secret is too short to hold a nonce")]
    Truncated,
    #[error("secret could not be encrypted")]
    Encrypt,
    #[error("stored secret could not be decrypted")]
    Decrypt,
    #[error("decrypted secret is not valid UTF-8")]
    Utf8,
}

#[derive(Clone)]
pub struct SecretKeyCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretKeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKeyCipher").finish_non_exhaustive()
    }
}

impl SecretKeyCipher {
    /// Builds a cipher from a 64 character hex key.
    pub fn from_hex(key: &str) -> Result<Self, SecretKeyError> {
        let key = hex::decode(key.trim()).map_err(|_| SecretKeyError::InvalidKey)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| SecretKeyError::InvalidKey)?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, secret: &str) -> Result<String, SecretKeyError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, secret.as_bytes())
            .map_err(|_| SecretKeyError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, SecretKeyError> {
        let blob = hex::decode(stored)?;
        if blob.len() <= NONCE_LEN {
            return Err(SecretKeyError::Truncated);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretKeyError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| SecretKeyError::Utf8)
    }
}

/// Whether `provided` matches the `stored` secret of an application.
pub fn secret_matches(stored: &str, provided: &str, cipher: Option<&SecretKeyCipher>) -> bool {
    if stored.len() == PLAINTEXT_SECRET_LEN {
        return constant_time_eq(stored.as_bytes(), provided.as_bytes());
    }

    let Some(cipher) = cipher else {
        warn!("encrypted secret key stored but no encryption key configured");
        return false;
    };
    match cipher.decrypt(stored) {
        Ok(secret) => constant_time_eq(secret.as_bytes(), provided.as_bytes()),
        Err(err) => {
            warn!(%err, "stored secret key unreadable");
            false
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

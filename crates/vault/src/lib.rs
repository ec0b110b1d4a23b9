//! escalatesafe_vault
//!
//! C9: authenticated symmetric encryption (AEAD) of stored credential
//! material. Ciphertexts carry an explicit one-byte key-version prefix
//! ahead of the nonce+ciphertext, so a future key rotation can keep
//! decrypting old records while encrypting new ones under a new key.
//!
//! Divergence from `original_source/api/utils/encryption.py`: the
//! original wraps Fernet (AES-128-CBC + HMAC) behind a lazily-initialized
//! global singleton (`get_encryption()`). This crate uses `ChaCha20Poly1305`
//! (no Fernet equivalent ships in this pack's Rust stack) constructed once
//! into the caller's `App` context and passed by reference — no
//! global/lazy-static singleton, per SPEC_FULL §9's design note.

use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use thiserror::Error;

pub const KEY_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const KEY_ENV_VAR: &str = "ENCRYPTION_MASTER_KEY";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("missing master key: set {KEY_ENV_VAR} (base64-encoded 32 bytes)")]
    MissingKey,
    #[error("master key must decode to exactly 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("invalid base64 ciphertext: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("ciphertext too short to contain a version byte and nonce")]
    Truncated,
    #[error("unsupported ciphertext key version: {0}")]
    UnsupportedVersion(u8),
    #[error("AEAD decryption failed — ciphertext is invalid or the key has changed")]
    DecryptionFailed,
    #[error("AEAD encryption failed")]
    EncryptionFailed,
}

pub struct Vault {
    cipher: ChaCha20Poly1305,
    key_version: u8,
}

impl Vault {
    pub fn new(key_bytes: &[u8], key_version: u8) -> Result<Self, VaultError> {
        if key_bytes.len() != 32 {
            return Err(VaultError::InvalidKeyLength(key_bytes.len()));
        }
        let key = Key::from_slice(key_bytes);
        Ok(Self { cipher: ChaCha20Poly1305::new(key), key_version })
    }

    /// Loads the master key from `ENCRYPTION_MASTER_KEY` (base64, 32
    /// bytes). A missing key in production is a fatal startup error; when
    /// `allow_dev_fallback` is set, a key is synthesized and a warning is
    /// logged instead of failing — intended for local development only.
    pub fn from_env(allow_dev_fallback: bool) -> Result<Self, VaultError> {
        match std::env::var(KEY_ENV_VAR) {
            Ok(encoded) => {
                let bytes = STANDARD.decode(encoded.trim())?;
                Self::new(&bytes, KEY_VERSION)
            }
            Err(_) if allow_dev_fallback => {
                let mut bytes = [0u8; 32];
                OsRng.fill_bytes(&mut bytes);
                tracing::warn!(
                    "no {KEY_ENV_VAR} set; synthesizing an ephemeral development key. \
                     Set this in production — ciphertexts will not survive a restart."
                );
                Self::new(&bytes, KEY_VERSION)
            }
            Err(_) => Err(VaultError::MissingKey),
        }
    }

    pub fn encrypt(&self, plain: &str) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plain.as_bytes())
            .map_err(|_| VaultError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        out.push(self.key_version);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, VaultError> {
        let raw = STANDARD.decode(encoded)?;
        if raw.len() < 1 + NONCE_LEN {
            return Err(VaultError::Truncated);
        }
        let version = raw[0];
        if version != self.key_version {
            return Err(VaultError::UnsupportedVersion(version));
        }
        let nonce = Nonce::from_slice(&raw[1..1 + NONCE_LEN]);
        let ciphertext = &raw[1 + NONCE_LEN..];

        let plain = self.cipher.decrypt(nonce, ciphertext).map_err(|_| VaultError::DecryptionFailed)?;
        String::from_utf8(plain).map_err(|_| VaultError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> Vault {
        Vault::new(&[7u8; 32], KEY_VERSION).unwrap()
    }

    #[test]
    fn round_trips() {
        let vault = test_vault();
        let cipher = vault.encrypt("super-secret-token").unwrap();
        assert_ne!(cipher, "super-secret-token");
        let plain = vault.decrypt(&cipher).unwrap();
        assert_eq!(plain, "super-secret-token");
    }

    #[test]
    fn ciphertext_carries_key_version_prefix() {
        let vault = test_vault();
        let cipher = vault.encrypt("x").unwrap();
        let raw = STANDARD.decode(&cipher).unwrap();
        assert_eq!(raw[0], KEY_VERSION);
    }

    #[test]
    fn two_encryptions_of_same_plaintext_differ() {
        // distinct random nonces per call
        let vault = test_vault();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let vault_a = Vault::new(&[1u8; 32], KEY_VERSION).unwrap();
        let vault_b = Vault::new(&[2u8; 32], KEY_VERSION).unwrap();
        let cipher = vault_a.encrypt("secret").unwrap();
        assert!(matches!(vault_b.decrypt(&cipher), Err(VaultError::DecryptionFailed)));
    }

    #[test]
    fn rejects_wrong_key_length() {
        assert!(matches!(Vault::new(&[0u8; 16], KEY_VERSION), Err(VaultError::InvalidKeyLength(16))));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let vault = test_vault();
        let mut raw = STANDARD.decode(vault.encrypt("x").unwrap()).unwrap();
        raw[0] = 99;
        let tampered = STANDARD.encode(raw);
        assert!(matches!(vault.decrypt(&tampered), Err(VaultError::UnsupportedVersion(99))));
    }
}

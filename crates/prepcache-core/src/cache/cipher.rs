//! At-rest encryption for cache files.
//!
//! The key is derived from a passphrase with Argon2 and a per-directory salt;
//! each file is sealed with ChaCha20-Poly1305 under a fresh random nonce,
//! stored as `nonce || ciphertext`.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use argon2::Argon2;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::RngCore;

/// File holding the key-derivation salt inside the cache directory
const SALT_FILE: &str = "cache.salt";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

pub struct CacheCipher {
    cipher: ChaCha20Poly1305,
}

impl CacheCipher {
    /// Derive a cipher from a passphrase and salt
    pub fn new(passphrase: &str, salt: &[u8]) -> Result<Self> {
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| anyhow!("Failed to derive cache key: {}", e))?;
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    /// Derive a cipher using the salt stored in `dir`, creating it on first use
    pub fn for_dir(dir: &Path, passphrase: &str) -> Result<Self> {
        let salt = Self::load_or_create_salt(dir)?;
        Self::new(passphrase, &salt)
    }

    fn load_or_create_salt(dir: &Path) -> Result<Vec<u8>> {
        let path = dir.join(SALT_FILE);
        if path.exists() {
            let salt = std::fs::read(&path).context("Failed to read cache salt")?;
            if salt.len() == SALT_LEN {
                return Ok(salt);
            }
            return Err(anyhow!("Cache salt has unexpected length {}", salt.len()));
        }

        let mut salt = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        std::fs::create_dir_all(dir)?;
        std::fs::write(&path, &salt).context("Failed to write cache salt")?;
        Ok(salt)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| anyhow!("Failed to encrypt cache data"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(anyhow!("Encrypted cache file is truncated"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("Failed to decrypt cache data - wrong passphrase or corrupt file"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = CacheCipher::new("correct horse", b"0123456789abcdef").expect("cipher");
        let sealed = cipher.encrypt(b"{\"name\":\"Sam\"}").expect("encrypt");
        assert!(!sealed.windows(3).any(|w| w == b"Sam"));
        assert_eq!(cipher.decrypt(&sealed).expect("decrypt"), b"{\"name\":\"Sam\"}");
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let salt = b"0123456789abcdef";
        let sealed = CacheCipher::new("right", salt).expect("cipher").encrypt(b"data").expect("encrypt");
        let wrong = CacheCipher::new("wrong", salt).expect("cipher");
        assert!(wrong.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_salt_is_reused_for_dir() {
        let dir = TempDir::new().expect("tempdir");
        let first = CacheCipher::for_dir(dir.path(), "pass").expect("cipher");
        let sealed = first.encrypt(b"contacts").expect("encrypt");
        let second = CacheCipher::for_dir(dir.path(), "pass").expect("cipher");
        assert_eq!(second.decrypt(&sealed).expect("decrypt"), b"contacts");
    }
}

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use rand::RngCore;
use zeroize::Zeroizing;

use skiff_types::error::{Result, SkiffError};

use crate::FileCrypter;

/// File format magic. Bumping the argon2 parameters means a new magic.
const MAGIC: &[u8; 4] = b"SKF1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM whole-file encryption, key derived from a passphrase with
/// argon2id and a per-file random salt.
///
/// File format: `SKF1 || salt(16) || nonce(12) || ciphertext+tag`.
pub struct AesFileCrypter {
    passphrase: Zeroizing<String>,
}

impl AesFileCrypter {
    pub fn new(passphrase: &str) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.to_string()),
        }
    }

    fn derive_key(&self, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        let mut key = Zeroizing::new([0u8; 32]);
        Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), salt, key.as_mut())
            .map_err(|e| SkiffError::Crypto(format!("key derivation failed: {e}")))?;
        Ok(key)
    }
}

impl FileCrypter for AesFileCrypter {
    fn module_name(&self) -> &str {
        "aes"
    }

    fn extension(&self) -> &str {
        "aes"
    }

    fn encrypt(&self, src: &Path, dst: &Path) -> Result<()> {
        let plaintext = fs::read(src)?;

        let mut salt = [0u8; SALT_LEN];
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key = self.derive_key(&salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| SkiffError::Crypto(format!("AES-GCM init: {e}")))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_ref())
            .map_err(|e| SkiffError::Crypto(format!("AES-GCM encrypt: {e}")))?;

        let mut out = fs::File::create(dst)?;
        out.write_all(MAGIC)?;
        out.write_all(&salt)?;
        out.write_all(&nonce_bytes)?;
        out.write_all(&ciphertext)?;
        out.flush()?;
        Ok(())
    }

    fn decrypt(&self, src: &Path, dst: &Path) -> Result<()> {
        let mut data = Vec::new();
        fs::File::open(src)?.read_to_end(&mut data)?;

        if data.len() < MAGIC.len() + SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(SkiffError::Crypto("encrypted file truncated".into()));
        }
        let (magic, rest) = data.split_at(MAGIC.len());
        if magic != MAGIC {
            return Err(SkiffError::Crypto("not an encrypted skiff file".into()));
        }
        let (salt, rest) = rest.split_at(SALT_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        let key = self.derive_key(salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| SkiffError::Crypto(format!("AES-GCM init: {e}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                SkiffError::Crypto("decryption failed: wrong passphrase or corrupted data".into())
            })?;

        fs::write(dst, &plaintext)?;
        Ok(())
    }
}

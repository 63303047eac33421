pub mod aes_file;
pub mod hashing;

use std::path::Path;

use skiff_types::error::{Result, SkiffError};

pub use aes_file::AesFileCrypter;

/// A file-level encryption module, keyed by a short module name that
/// doubles as the filename extension of files it produces.
pub trait FileCrypter: Send + Sync {
    /// The module name ("aes", ...).
    fn module_name(&self) -> &str;

    /// The filename extension appended to encrypted files.
    fn extension(&self) -> &str;

    /// Encrypt `src` into `dst`.
    fn encrypt(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Decrypt `src` into `dst`. Failures must surface as
    /// [`SkiffError::Crypto`] so callers can tell corruption from
    /// transport errors.
    fn decrypt(&self, src: &Path, dst: &Path) -> Result<()>;
}

/// Extensions produced by the known encryption modules.
pub fn known_encryption_extensions() -> &'static [&'static str] {
    &["aes"]
}

/// Extensions of the archive formats volume bodies are written in.
/// A remote file ending in one of these (with no encryption extension
/// on top) is stored unencrypted.
pub fn known_compression_extensions() -> &'static [&'static str] {
    &["zip", "zst"]
}

/// Look up an encryption module by name.
pub fn crypter_by_name(name: &str, passphrase: &str) -> Result<Box<dyn FileCrypter>> {
    match name {
        "aes" => Ok(Box::new(AesFileCrypter::new(passphrase))),
        other => Err(SkiffError::Crypto(format!(
            "encryption module not found: '{other}'"
        ))),
    }
}

/// Look up an encryption module by the filename extension it produces.
pub fn crypter_by_extension(ext: &str, passphrase: &str) -> Result<Box<dyn FileCrypter>> {
    let name = known_encryption_extensions()
        .iter()
        .find(|known| known.eq_ignore_ascii_case(ext))
        .ok_or_else(|| {
            SkiffError::Crypto(format!("no encryption module for extension '{ext}'"))
        })?;
    crypter_by_name(name, passphrase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name_and_extension() {
        assert!(crypter_by_name("aes", "pw").is_ok());
        assert!(crypter_by_name("rot13", "pw").is_err());
        assert!(crypter_by_extension("AES", "pw").is_ok());
        assert!(crypter_by_extension("zip", "pw").is_err());
    }

    #[test]
    fn extension_sets_do_not_overlap() {
        for enc in known_encryption_extensions() {
            assert!(!known_compression_extensions().contains(enc));
        }
    }
}

use std::fs;
use std::io::Read;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use blake2::digest::consts::U32;
use blake2::digest::Digest;
use blake2::Blake2b;
use sha2::Sha256;

use skiff_types::error::{Result, SkiffError};

/// Default file-hash algorithm.
pub const DEFAULT_HASH_ALGORITHM: &str = "blake2b256";

/// Incremental hasher producing a base64 digest.
pub trait StreamingHasher: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize_base64(self: Box<Self>) -> String;
}

struct DigestHasher<D: Digest + Send>(D);

impl<D: Digest + Send> StreamingHasher for DigestHasher<D> {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize_base64(self: Box<Self>) -> String {
        BASE64.encode(self.0.finalize())
    }
}

/// Create a streaming hasher for the named algorithm.
pub fn hasher_for(algorithm: &str) -> Result<Box<dyn StreamingHasher>> {
    match algorithm {
        "blake2b256" => Ok(Box::new(DigestHasher(Blake2b::<U32>::new()))),
        "sha256" => Ok(Box::new(DigestHasher(Sha256::new()))),
        other => Err(SkiffError::Config(format!(
            "unknown hash algorithm: '{other}'"
        ))),
    }
}

/// Hash a file, returning the base64 digest and the file size in bytes.
pub fn hash_file_base64(algorithm: &str, path: &Path) -> Result<(String, i64)> {
    let mut hasher = hasher_for(algorithm)?;
    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0i64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as i64;
    }
    Ok((hasher.finalize_base64(), size))
}

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use skiff_types::error::{Result, SkiffError};

fn default_retry_count() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    10_000
}

fn default_retry_max_delay_ms() -> u64 {
    10 * 60 * 1000
}

fn default_parallel_transfers() -> usize {
    4
}

fn default_encryption_module() -> String {
    "aes".to_string()
}

fn default_hash_algorithm() -> String {
    skiff_crypto::hashing::DEFAULT_HASH_ALGORITHM.to_string()
}

fn default_volume_prefix() -> String {
    "skiff".to_string()
}

fn default_autocreate_folders() -> bool {
    true
}

/// Configuration for one transfer manager instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Number of execution attempts per operation.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Delay before a retry attempt, in milliseconds. 0 disables the wait.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Double the delay on every failed attempt.
    #[serde(default)]
    pub exponential_backoff: bool,
    /// Upper bound for the exponential delay.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Max concurrently running uploads (min 1).
    #[serde(default = "default_parallel_transfers")]
    pub max_parallel_uploads: usize,
    /// Max concurrently running downloads (min 1).
    #[serde(default = "default_parallel_transfers")]
    pub max_parallel_downloads: usize,

    /// Upload rate cap in bytes per second. 0 = unlimited.
    #[serde(default)]
    pub max_upload_bytes_per_second: u64,
    /// Download rate cap in bytes per second. 0 = unlimited.
    #[serde(default)]
    pub max_download_bytes_per_second: u64,

    /// Encryption module applied to volumes ("aes").
    #[serde(default = "default_encryption_module")]
    pub encryption_module: String,
    /// Disable encryption entirely.
    #[serde(default)]
    pub no_encryption: bool,
    /// Passphrase for the encryption module.
    #[serde(default)]
    pub passphrase: Option<String>,

    /// Algorithm for volume file hashes ("blake2b256", "sha256").
    #[serde(default = "default_hash_algorithm")]
    pub file_hash_algorithm: String,

    /// Force whole-file transfers even on streaming-capable backends.
    #[serde(default)]
    pub disable_streaming_transfers: bool,
    /// Skip download size/hash verification.
    #[serde(default)]
    pub skip_hash_checks: bool,
    /// Never query backend quota.
    #[serde(default)]
    pub disable_quota_info: bool,
    /// After each upload, list the destination and verify presence+size.
    #[serde(default)]
    pub list_verify_uploads: bool,
    /// Dispose backend connections after each operation instead of pooling.
    #[serde(default)]
    pub no_connection_reuse: bool,
    /// Create the destination folder on the first folder-missing failure.
    #[serde(default = "default_autocreate_folders")]
    pub autocreate_folders: bool,

    /// Prefix for generated volume filenames.
    #[serde(default = "default_volume_prefix")]
    pub volume_prefix: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            exponential_backoff: false,
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_parallel_uploads: default_parallel_transfers(),
            max_parallel_downloads: default_parallel_transfers(),
            max_upload_bytes_per_second: 0,
            max_download_bytes_per_second: 0,
            encryption_module: default_encryption_module(),
            no_encryption: false,
            passphrase: None,
            file_hash_algorithm: default_hash_algorithm(),
            disable_streaming_transfers: false,
            skip_hash_checks: false,
            disable_quota_info: false,
            list_verify_uploads: false,
            no_connection_reuse: false,
            autocreate_folders: default_autocreate_folders(),
            volume_prefix: default_volume_prefix(),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry_count == 0 {
            return Err(SkiffError::Config(
                "retry_count must be at least 1".into(),
            ));
        }
        if self.max_parallel_uploads == 0 || self.max_parallel_downloads == 0 {
            return Err(SkiffError::Config(
                "parallel transfer limits must be at least 1".into(),
            ));
        }
        if !self.no_encryption && self.passphrase.as_deref().unwrap_or("").is_empty() {
            return Err(SkiffError::Config(
                "a passphrase is required unless no_encryption is set".into(),
            ));
        }
        skiff_crypto::hashing::hasher_for(&self.file_hash_algorithm)?;
        if !self.no_encryption {
            skiff_crypto::crypter_by_name(&self.encryption_module, "probe")?;
        }
        Ok(())
    }

    /// Passphrase wrapped for zero-on-drop handling at use sites.
    pub(crate) fn passphrase_for_use(&self) -> Zeroizing<String> {
        Zeroizing::new(self.passphrase.clone().unwrap_or_default())
    }

    /// Delay before attempt `attempt` (1-based), honoring backoff mode.
    pub(crate) fn retry_delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let base = self.retry_delay_ms;
        let ms = if self.exponential_backoff {
            base.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(20))
                .min(self.retry_max_delay_ms)
        } else {
            base
        };
        std::time::Duration::from_millis(ms)
    }
}

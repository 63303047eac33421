use std::fs;
use std::io::Write;
use std::time::Instant;

use tempfile::TempPath;
use tracing::{debug, warn};

use skiff_crypto::hashing::{hash_file_base64, hasher_for};
use skiff_crypto::FileCrypter;
use skiff_storage::Backend;
use skiff_types::error::{Result, SkiffError};

use crate::cancel::{CancelSet, CancelToken};
use crate::config::TransferConfig;
use crate::manager::operation::{CompletionSlot, DownloadedFile, OperationKind};
use crate::manager::progress::TransferEvent;
use crate::manager::ExecuteContext;
use crate::streams::{HashingWriter, ProgressWriter, ThrottledWriter};

/// A pending download with optional decryption and verification.
pub(crate) struct GetOperation {
    pub remote_name: String,
    /// Expected size, -1 if unknown.
    pub size: i64,
    /// Expected base64 hash, `None`/empty if unknown.
    pub expected_hash: Option<String>,
    pub decrypt: bool,
    pub cancel: CancelToken,
    pub slot: CompletionSlot<DownloadedFile>,
}

impl GetOperation {
    /// One execution attempt: download, verify, decrypt, resolve.
    pub fn execute(&mut self, backend: &dyn Backend, ctx: &ExecuteContext) -> Result<()> {
        // Resolve the decryption module up front; a bad module choice
        // should not cost a download.
        let decrypter = if self.decrypt {
            detect_decrypter(&self.remote_name, &ctx.config)?
        } else {
            None
        };

        ctx.progress
            .transfer_started(OperationKind::Get, &self.remote_name, self.size);
        let begin = Instant::now();
        let downloaded = self.download(backend, ctx);
        ctx.progress.transfer_completed(&self.remote_name);
        let (encrypted_file, download_size, file_hash) = downloaded?;

        debug!(
            file = %self.remote_name,
            bytes = download_size,
            elapsed_ms = begin.elapsed().as_millis() as u64,
            "download finished"
        );
        ctx.collector.log_operation(
            "get",
            &self.remote_name,
            &serde_json::json!({ "Size": download_size, "Hash": file_hash }).to_string(),
        );
        ctx.progress.send_event(TransferEvent::Completed {
            kind: OperationKind::Get.as_str(),
            name: self.remote_name.clone(),
            size: download_size,
        });

        if !ctx.config.skip_hash_checks {
            if self.size >= 0 && download_size != self.size {
                return Err(SkiffError::VerificationMismatch {
                    path: self.remote_name.clone(),
                    expected: format!("size {}", self.size),
                    actual: format!("size {download_size}"),
                });
            }
            if let Some(expected) = self.expected_hash.as_deref().filter(|h| !h.is_empty()) {
                if file_hash != expected {
                    return Err(SkiffError::VerificationMismatch {
                        path: self.remote_name.clone(),
                        expected: format!("hash {expected}"),
                        actual: format!("hash {file_hash}"),
                    });
                }
            }
        }

        // Decrypt after verification, so the hash covers the exact bytes
        // that came off the wire.
        let final_file = match decrypter {
            Some(crypter) => decrypt_file(encrypted_file, crypter.as_ref())?,
            None => encrypted_file,
        };

        self.slot.resolve_ok((final_file, file_hash, download_size));
        Ok(())
    }

    /// Download into a temp file, returning it with the byte count and
    /// hash of the received content. The temp file is removed on every
    /// failure path.
    fn download(
        &self,
        backend: &dyn Backend,
        ctx: &ExecuteContext,
    ) -> Result<(TempPath, i64, String)> {
        let target = tempfile::NamedTempFile::new()?.into_temp_path();

        match backend.as_streaming() {
            Some(streaming) if !ctx.config.disable_streaming_transfers => {
                let cancel = CancelSet::new([
                    self.cancel.clone(),
                    ctx.hard_cancel.clone(),
                    ctx.abort.clone(),
                ]);
                let file = fs::File::create(&target)?;
                let hashing =
                    HashingWriter::new(file, hasher_for(&ctx.config.file_hash_algorithm)?);
                let throttled = ThrottledWriter::new(
                    hashing,
                    ctx.config.max_download_bytes_per_second,
                    cancel,
                );
                let name = self.remote_name.clone();
                let mut writer = ProgressWriter::new(throttled, |bytes| {
                    ctx.progress.report(&name, bytes);
                });
                streaming.get_stream(&self.remote_name, &mut writer)?;
                writer.flush()?;

                let (hash, bytes, mut file) = writer.into_inner().into_inner().finish();
                file.flush()?;
                Ok((target, bytes as i64, hash))
            }
            _ => {
                backend.get(&self.remote_name, &target)?;
                let (hash, size) =
                    hash_file_base64(&ctx.config.file_hash_algorithm, &target)?;
                Ok((target, size, hash))
            }
        }
    }
}

/// Pick the decryption module for a downloaded file by comparing its
/// filename extension against the configured module and the known
/// compression/encryption extensions. Makes restores work from folders
/// holding a mix of encrypted and plaintext volumes.
fn detect_decrypter(
    filename: &str,
    config: &TransferConfig,
) -> Result<Option<Box<dyn FileCrypter>>> {
    let passphrase = config.passphrase_for_use();
    let configured: Option<Box<dyn FileCrypter>> = if config.no_encryption {
        None
    } else {
        Some(skiff_crypto::crypter_by_name(
            &config.encryption_module,
            &passphrase,
        )?)
    };

    let ext = filename.rsplit_once('.').map(|(_, e)| e).unwrap_or("");

    if let Some(crypter) = &configured {
        if crypter.extension().eq_ignore_ascii_case(ext) {
            return Ok(configured);
        }
    }

    if skiff_crypto::known_compression_extensions()
        .iter()
        .any(|known| known.eq_ignore_ascii_case(ext))
    {
        if configured.is_some() {
            debug!(
                "extension \"{ext}\" does not match encryption module \"{}\", \
                 guessing that \"{filename}\" is not encrypted",
                config.encryption_module
            );
        }
        return Ok(None);
    }

    if skiff_crypto::known_encryption_extensions()
        .iter()
        .any(|known| known.eq_ignore_ascii_case(ext))
    {
        match skiff_crypto::crypter_by_extension(ext, &passphrase) {
            Ok(crypter) => return Ok(Some(crypter)),
            Err(e) => warn!(
                "failed to load encryption module for extension \"{ext}\", \
                 using configured module: {e}"
            ),
        }
    }

    Ok(configured)
}

/// Decrypt into a second temp file. The encrypted source file is removed
/// on every path; on success only the decrypted file survives.
fn decrypt_file(source: TempPath, crypter: &dyn FileCrypter) -> Result<TempPath> {
    let target = tempfile::NamedTempFile::new()?.into_temp_path();
    crypter.decrypt(&source, &target)?;
    drop(source);
    Ok(target)
}

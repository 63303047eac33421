use std::fs;
use std::thread::JoinHandle;
use std::time::Instant;

use tempfile::TempPath;
use tracing::{debug, info};

use skiff_crypto::hashing::hash_file_base64;
use skiff_storage::Backend;
use skiff_types::error::{Result, SkiffError};
use skiff_types::remote_volume::VolumeState;
use skiff_types::volume_name::fresh_rename;

use crate::cancel::{CancelSet, CancelToken};
use crate::config::TransferConfig;
use crate::manager::operation::{completion, CompletionSlot, OperationKind};
use crate::manager::progress::TransferEvent;
use crate::manager::volume::IndexVolumeWriter;
use crate::manager::ExecuteContext;
use crate::streams::{ProgressReader, ThrottledReader};

/// Upload progress of a put operation. Only moves forward; a failed
/// attempt renames the remote target instead of regressing the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PutState {
    None,
    Uploading,
    Uploaded,
    Completed,
}

/// The detached encryption+hashing work, started once per operation.
enum PrepareState {
    NotStarted,
    Running(JoinHandle<Result<(Option<String>, i64, TempPath)>>),
    Done { hash: Option<String>, size: i64 },
    Failed(SkiffError),
}

/// An index volume riding along with a block volume upload. Rebuilt
/// content-wise when the block volume is renamed between attempts.
struct IndexCoupling {
    writer: IndexVolumeWriter,
    op: Box<PutOperation>,
}

/// A pending upload.
///
/// The upload treats a block volume and its optional index volume as one
/// operation for the caller, but internally runs them as two coupled
/// uploads through the same state machine.
pub(crate) struct PutOperation {
    remote_name: String,
    pub(crate) local_file: Option<TempPath>,
    unencrypted: bool,
    tracked_in_db: bool,
    pub(crate) wait_for_complete: bool,
    pub(crate) cancel: CancelToken,
    pub(crate) slot: CompletionSlot<i64>,
    state: PutState,
    prepare: PrepareState,
    original_index: Option<IndexVolumeWriter>,
    index_finished: Option<Box<dyn FnOnce() + Send>>,
    index: Option<IndexCoupling>,
}

impl PutOperation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote_name: String,
        local_file: TempPath,
        unencrypted: bool,
        tracked_in_db: bool,
        wait_for_complete: bool,
        cancel: CancelToken,
        slot: CompletionSlot<i64>,
        original_index: Option<IndexVolumeWriter>,
        index_finished: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            remote_name,
            local_file: Some(local_file),
            unencrypted,
            tracked_in_db,
            wait_for_complete,
            cancel,
            slot,
            state: PutState::None,
            prepare: PrepareState::NotStarted,
            original_index,
            index_finished,
            index: None,
        }
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    /// Size once hashing has completed, -1 before that.
    pub fn known_size(&self) -> i64 {
        match self.prepare {
            PrepareState::Done { size, .. } => size,
            _ => -1,
        }
    }

    /// Signal the queueing caller that the upload was admitted. For
    /// fire-and-forget puts this is the caller-visible completion.
    pub fn resolve_accepted(&self) {
        self.slot.resolve_ok(self.known_size());
    }

    /// Launch the detached encryption and hashing work so it overlaps
    /// with time spent waiting in the queue. Must be called exactly once
    /// before the first execution attempt.
    pub fn start_encryption_and_hashing(&mut self, config: &TransferConfig) -> Result<()> {
        if !matches!(self.prepare, PrepareState::NotStarted) {
            return Err(SkiffError::Other(
                "encryption and hashing already started".into(),
            ));
        }
        let file = self
            .local_file
            .take()
            .ok_or_else(|| SkiffError::Other("upload has no local file".into()))?;

        let encrypt = !config.no_encryption && !self.unencrypted;
        let module = config.encryption_module.clone();
        let passphrase = config.passphrase_for_use();
        let tracked = self.tracked_in_db;
        let algorithm = config.file_hash_algorithm.clone();

        let handle = std::thread::Builder::new()
            .name("skiff-prepare".into())
            .spawn(move || -> Result<(Option<String>, i64, TempPath)> {
                let mut file = file;
                if encrypt {
                    let crypter = skiff_crypto::crypter_by_name(&module, &passphrase)?;
                    let encrypted = tempfile::NamedTempFile::new()?;
                    crypter.encrypt(&file, encrypted.path())?;
                    // Replaces the plaintext temp file, which is removed here.
                    file = encrypted.into_temp_path();
                }
                if !tracked {
                    return Ok((None, -1, file));
                }
                let (hash, size) = hash_file_base64(&algorithm, &file)?;
                Ok((Some(hash), size, file))
            })?;

        self.prepare = PrepareState::Running(handle);
        Ok(())
    }

    fn prepare_not_started(&self) -> bool {
        matches!(self.prepare, PrepareState::NotStarted)
    }

    /// Join the preparation work (once) and return the hash/size. Retry
    /// attempts get the cached values without recomputing; a failed
    /// preparation keeps failing with the same error.
    fn ensure_prepared(&mut self) -> Result<(Option<String>, i64)> {
        let state = std::mem::replace(&mut self.prepare, PrepareState::NotStarted);
        match state {
            PrepareState::NotStarted => Err(SkiffError::Other(
                "encryption and hashing not started".into(),
            )),
            PrepareState::Done { hash, size } => {
                self.prepare = PrepareState::Done {
                    hash: hash.clone(),
                    size,
                };
                Ok((hash, size))
            }
            PrepareState::Failed(err) => {
                let copy = err.clone_message();
                self.prepare = PrepareState::Failed(err);
                Err(copy)
            }
            PrepareState::Running(handle) => match handle.join() {
                Ok(Ok((hash, size, file))) => {
                    self.local_file = Some(file);
                    self.prepare = PrepareState::Done {
                        hash: hash.clone(),
                        size,
                    };
                    Ok((hash, size))
                }
                Ok(Err(err)) => {
                    let copy = err.clone_message();
                    self.prepare = PrepareState::Failed(err);
                    Err(copy)
                }
                Err(_) => {
                    let err = SkiffError::Other("encryption thread panicked".into());
                    self.prepare = PrepareState::Failed(err.clone_message());
                    Err(err)
                }
            },
        }
    }

    /// One execution attempt. The dispatcher's retry loop drives this
    /// through the state machine until it reaches `Completed`.
    pub fn execute(&mut self, backend: &dyn Backend, ctx: &ExecuteContext) -> Result<()> {
        match self.state {
            PutState::Completed => {
                return Err(SkiffError::Other("put operation already completed".into()))
            }
            PutState::Uploaded => {
                // Retry after the block volume landed: only the coupled
                // index upload remains.
                return match self.index.take() {
                    Some(coupling) => {
                        self.run_index_upload(coupling, backend, ctx)?;
                        self.state = PutState::Completed;
                        self.slot.resolve_ok(self.known_size());
                        Ok(())
                    }
                    None => Err(SkiffError::Other("put operation already uploaded".into())),
                };
            }
            PutState::None | PutState::Uploading => {}
        }

        // On retries this returns the cached values without recomputing.
        let (hash, size) = self.ensure_prepared()?;

        if self.state == PutState::None && self.tracked_in_db {
            ctx.collector.log_volume_update(
                &self.remote_name,
                VolumeState::Uploading,
                size,
                hash.as_deref(),
            );
        }

        // First attempt with an index volume attached: its content can
        // only be finalized now that the block volume's hash and size are
        // known.
        if self.index.is_none() {
            if let Some(mut writer) = self.original_index.take() {
                ctx.collector.log_volume_update(
                    &writer.remote_name,
                    VolumeState::Uploading,
                    -1,
                    None,
                );
                let index_file = writer.finish(&self.remote_name, hash.as_deref(), size)?;
                if let Some(callback) = self.index_finished.take() {
                    callback();
                }
                let (slot, _discarded) = completion();
                let op = PutOperation::new(
                    writer.remote_name.clone(),
                    index_file,
                    self.unencrypted,
                    self.tracked_in_db,
                    false,
                    self.cancel.clone(),
                    slot,
                    None,
                    None,
                );
                self.index = Some(IndexCoupling {
                    writer,
                    op: Box::new(op),
                });
            }
        }

        // A previous attempt reached the backend under the old name, so
        // the retry goes to a fresh name.
        if self.state == PutState::Uploading {
            self.rename_after_error(ctx)?;
        }

        self.state = PutState::Uploading;
        self.perform_upload(backend, ctx, hash.as_deref(), size)?;
        self.state = PutState::Uploaded;

        if let Some(coupling) = self.index.take() {
            self.run_index_upload(coupling, backend, ctx)?;
        }

        self.state = PutState::Completed;
        self.slot.resolve_ok(size);
        Ok(())
    }

    /// Run the coupled index upload. On failure the coupling is kept so
    /// the next retry attempt resumes with it.
    fn run_index_upload(
        &mut self,
        mut coupling: IndexCoupling,
        backend: &dyn Backend,
        ctx: &ExecuteContext,
    ) -> Result<()> {
        let result = (|| {
            if coupling.op.prepare_not_started() {
                coupling.op.start_encryption_and_hashing(&ctx.config)?;
            }
            coupling.op.execute(backend, ctx)
        })();
        if let Err(e) = result {
            self.index = Some(coupling);
            return Err(e);
        }
        Ok(())
    }

    /// Pick a fresh remote name for the retry and rewrite the coupled
    /// index volume, which references the block volume by name.
    fn rename_after_error(&mut self, ctx: &ExecuteContext) -> Result<()> {
        let old = self.remote_name.clone();
        let new = fresh_rename(&old);

        info!("renaming \"{old}\" to \"{new}\"");
        ctx.progress.send_event(TransferEvent::Renamed {
            old: old.clone(),
            new: new.clone(),
        });
        ctx.collector.log_rename(&old, &new);
        self.remote_name = new.clone();

        if let Some(coupling) = self.index.as_mut() {
            let rewritten = coupling.writer.rewrite_renamed(&old, &new)?;
            // Swap in the rewritten temp file; the stale one is removed.
            coupling.op.local_file = Some(rewritten);
        }
        Ok(())
    }

    fn perform_upload(
        &mut self,
        backend: &dyn Backend,
        ctx: &ExecuteContext,
        hash: Option<&str>,
        size: i64,
    ) -> Result<()> {
        ctx.collector.log_operation(
            "put",
            &self.remote_name,
            &serde_json::json!({ "Size": size, "Hash": hash }).to_string(),
        );
        ctx.progress
            .transfer_started(OperationKind::Put, &self.remote_name, size);

        let begin = Instant::now();
        let result = self.transfer(backend, ctx);
        ctx.progress.transfer_completed(&self.remote_name);
        result?;

        debug!(
            file = %self.remote_name,
            bytes = size,
            elapsed_ms = begin.elapsed().as_millis() as u64,
            "upload finished"
        );

        if self.tracked_in_db {
            ctx.collector.log_volume_update(
                &self.remote_name,
                VolumeState::Uploaded,
                size,
                hash,
            );
        }
        ctx.progress.send_event(TransferEvent::Completed {
            kind: OperationKind::Put.as_str(),
            name: self.remote_name.clone(),
            size,
        });

        if ctx.config.list_verify_uploads {
            self.verify_by_listing(backend, size)?;
        }

        // The local temp file is removed only after verification passed,
        // so a failed verify can retry with the same content.
        self.local_file = None;
        Ok(())
    }

    fn transfer(&self, backend: &dyn Backend, ctx: &ExecuteContext) -> Result<()> {
        let local = self
            .local_file
            .as_ref()
            .ok_or_else(|| SkiffError::Other("upload has no local file".into()))?;

        match backend.as_streaming() {
            Some(streaming) if !ctx.config.disable_streaming_transfers => {
                let cancel = CancelSet::new([
                    self.cancel.clone(),
                    ctx.hard_cancel.clone(),
                    ctx.abort.clone(),
                ]);
                let file = fs::File::open(local)?;
                let throttled =
                    ThrottledReader::new(file, ctx.config.max_upload_bytes_per_second, cancel);
                let name = self.remote_name.clone();
                let mut reader = ProgressReader::new(throttled, |bytes| {
                    ctx.progress.report(&name, bytes);
                });
                streaming.put_stream(&self.remote_name, &mut reader)
            }
            _ => backend.put(&self.remote_name, local),
        }
    }

    fn verify_by_listing(&self, backend: &dyn Backend, size: i64) -> Result<()> {
        let entries = backend.list()?;
        let entry = entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(&self.remote_name));
        match entry {
            None => Err(SkiffError::Other(format!(
                "list verify failed, file was not found after upload: {}",
                self.remote_name
            ))),
            Some(e) if e.size >= 0 && e.size != size => Err(SkiffError::VerificationMismatch {
                path: self.remote_name.clone(),
                expected: format!("size {size}"),
                actual: format!("size {}", e.size),
            }),
            Some(_) => Ok(()),
        }
    }
}

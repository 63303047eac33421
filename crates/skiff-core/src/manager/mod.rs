pub(crate) mod collector;
pub(crate) mod get;
pub(crate) mod handler;
pub(crate) mod operation;
pub(crate) mod pool;
pub(crate) mod progress;
pub(crate) mod put;
mod volume;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use tempfile::TempPath;
use tracing::warn;

use skiff_types::error::{Result, SkiffError};
use skiff_types::remote_volume::{FileEntry, QuotaInfo, RemoteVolume};

use crate::cancel::CancelToken;
use crate::config::TransferConfig;
use crate::database::VolumeDatabase;

use collector::DatabaseCollector;
use operation::{completion, PendingOperation};
use progress::ProgressHandler;

pub use pool::BackendFactory;
pub use progress::TransferEvent;
pub use volume::{IndexVolumeWriter, VolumeUpload};

/// Everything operation execution needs, shared between the dispatcher
/// and its transfer workers.
pub(crate) struct ExecuteContext {
    pub config: TransferConfig,
    pub collector: DatabaseCollector,
    pub progress: ProgressHandler,
    /// Caller-level "stop taking new work". Cancels retry backoff waits.
    pub soft_cancel: CancelToken,
    /// Caller-level "abort transfers now".
    pub hard_cancel: CancelToken,
    /// Fired by the dispatcher itself during shutdown.
    pub abort: CancelToken,
}

/// Public facade over the transfer core.
///
/// Requests become queued operations on one ordered channel; a dispatcher
/// thread admits them under the concurrency rules and resolves each
/// operation's completion exactly once. Methods block until the operation
/// yields its caller-visible result: the full outcome for waited
/// operations, admission for fire-and-forget ones.
pub struct TransferManager {
    requests: Mutex<Option<Sender<PendingOperation>>>,
    dispatcher: Mutex<Option<std::thread::JoinHandle<Result<()>>>>,
    terminal_error: Mutex<Option<String>>,
    ctx: Arc<ExecuteContext>,
    last_read_size: AtomicI64,
    last_write_size: AtomicI64,
}

impl TransferManager {
    /// Create a manager for the given destination URL.
    pub fn new(
        backend_url: &str,
        config: TransferConfig,
        events: Option<Sender<TransferEvent>>,
    ) -> Result<Self> {
        let url = backend_url.to_string();
        Self::with_backend_factory(
            Box::new(move || skiff_storage::backend_from_url(&url)),
            config,
            events,
        )
    }

    /// Create a manager with a custom backend factory. This is how
    /// plugin-provided backends (and tests) plug in.
    pub fn with_backend_factory(
        factory: BackendFactory,
        config: TransferConfig,
        events: Option<Sender<TransferEvent>>,
    ) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(pool::BackendPool::new(
            factory,
            !config.no_connection_reuse,
        ));
        let ctx = Arc::new(ExecuteContext {
            config,
            collector: DatabaseCollector::new(),
            progress: ProgressHandler::new(events),
            soft_cancel: CancelToken::new(),
            hard_cancel: CancelToken::new(),
            abort: CancelToken::new(),
        });

        let (tx, rx) = crossbeam_channel::unbounded();
        let dispatcher_ctx = Arc::clone(&ctx);
        let dispatcher = std::thread::Builder::new()
            .name("skiff-dispatcher".into())
            .spawn(move || handler::run(rx, pool, dispatcher_ctx))?;

        Ok(Self {
            requests: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            terminal_error: Mutex::new(None),
            ctx,
            last_read_size: AtomicI64::new(-1),
            last_write_size: AtomicI64::new(-1),
        })
    }

    // --- Queueing ---

    fn enqueue(&self, op: PendingOperation) -> Result<()> {
        let sender = self
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match sender {
            Some(tx) => tx.send(op).map_err(|_| self.stopped_error()),
            None => Err(self.stopped_error()),
        }
    }

    /// Error for requests arriving after the dispatcher is gone, carrying
    /// the dispatcher's own terminal failure when there was one.
    fn stopped_error(&self) -> SkiffError {
        self.collect_dispatcher_result(false);
        let terminal = self
            .terminal_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match terminal {
            Some(msg) => SkiffError::Other(format!("backend manager is stopped: {msg}")),
            None => SkiffError::Other("backend manager is stopped".into()),
        }
    }

    /// Join the dispatcher if it is done (or unconditionally with
    /// `block`), recording a terminal error for later reporting.
    fn collect_dispatcher_result(&self, block: bool) {
        let mut guard = self.dispatcher.lock().unwrap_or_else(|e| e.into_inner());
        let finished = guard.as_ref().map(|h| h.is_finished()).unwrap_or(false);
        if !(block || finished) {
            return;
        }
        if let Some(handle) = guard.take() {
            let outcome = handle
                .join()
                .unwrap_or_else(|_| Err(SkiffError::Other("dispatcher panicked".into())));
            if let Err(e) = outcome {
                warn!("dispatcher terminated with failure: {e}");
                *self
                    .terminal_error
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(e.to_string());
            }
        }
    }

    // --- Transfers ---

    /// Upload a volume, optionally coupled with its index volume.
    ///
    /// With `wait_for_complete` unset, this returns as soon as the upload
    /// is admitted; a later unrecoverable failure then terminates the
    /// manager. `index_finished` runs once the index volume's content has
    /// been finalized against the uploaded volume's hash and size.
    pub fn put(
        &self,
        volume: VolumeUpload,
        index_volume: Option<IndexVolumeWriter>,
        index_finished: Option<Box<dyn FnOnce() + Send>>,
        wait_for_complete: bool,
        cancel: CancelToken,
    ) -> Result<()> {
        let (slot, handle) = completion();
        let mut op = put::PutOperation::new(
            volume.remote_name,
            volume.local_file,
            false,
            true,
            wait_for_complete,
            cancel,
            slot,
            index_volume,
            index_finished,
        );
        // Encryption and hashing overlap with time spent in the queue.
        op.start_encryption_and_hashing(&self.ctx.config)?;
        self.enqueue(PendingOperation::Put(op))?;
        let size = handle.wait()?;
        if size >= 0 {
            self.last_write_size.store(size, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Upload a file verbatim: no encryption, not tracked in the
    /// database. Used for verification files and similar sidecars.
    pub fn put_verification_file(
        &self,
        remote_name: &str,
        file: TempPath,
        cancel: CancelToken,
    ) -> Result<()> {
        let (slot, handle) = completion();
        let mut op = put::PutOperation::new(
            remote_name.to_string(),
            file,
            true,
            false,
            true,
            cancel,
            slot,
            None,
            None,
        );
        op.start_encryption_and_hashing(&self.ctx.config)?;
        self.enqueue(PendingOperation::Put(op))?;
        handle.wait()?;
        Ok(())
    }

    fn get_inner(
        &self,
        remote_name: &str,
        hash: Option<&str>,
        size: i64,
        decrypt: bool,
        cancel: CancelToken,
    ) -> Result<(TempPath, String, i64)> {
        let (slot, handle) = completion();
        let op = get::GetOperation {
            remote_name: remote_name.to_string(),
            size,
            expected_hash: hash.filter(|h| !h.is_empty()).map(str::to_string),
            decrypt,
            cancel,
            slot,
        };
        self.enqueue(PendingOperation::Get(op))?;
        let (file, file_hash, download_size) = handle.wait()?;
        self.last_read_size.store(download_size, Ordering::SeqCst);
        Ok((file, file_hash, download_size))
    }

    /// Download and decrypt a volume, verifying hash and size when known.
    pub fn get(
        &self,
        remote_name: &str,
        hash: Option<&str>,
        size: i64,
        cancel: CancelToken,
    ) -> Result<TempPath> {
        self.get_inner(remote_name, hash, size, true, cancel)
            .map(|(file, _, _)| file)
    }

    /// Download a volume without decrypting it.
    pub fn get_direct(
        &self,
        remote_name: &str,
        hash: Option<&str>,
        size: i64,
        cancel: CancelToken,
    ) -> Result<TempPath> {
        self.get_inner(remote_name, hash, size, false, cancel)
            .map(|(file, _, _)| file)
    }

    /// Download and decrypt a volume, returning the verified hash and
    /// size of the downloaded content along with the file.
    pub fn get_with_info(
        &self,
        remote_name: &str,
        hash: Option<&str>,
        size: i64,
        cancel: CancelToken,
    ) -> Result<(TempPath, String, i64)> {
        self.get_inner(remote_name, hash, size, true, cancel)
    }

    /// Download a batch of volumes with prefetch: queueing them all up
    /// front lets the dispatcher overlap downloads (up to its cap) with
    /// the caller's processing of each yielded file. Results come back in
    /// request order as `(file, hash, size, name)`.
    pub fn get_files_overlapped(
        &self,
        volumes: Vec<RemoteVolume>,
        cancel: CancelToken,
    ) -> Result<impl Iterator<Item = Result<(TempPath, String, i64, String)>> + '_> {
        let mut queued = Vec::with_capacity(volumes.len());
        for volume in volumes {
            let (slot, handle) = completion();
            let op = get::GetOperation {
                remote_name: volume.name.clone(),
                size: volume.size,
                expected_hash: volume.hash.clone().filter(|h| !h.is_empty()),
                decrypt: true,
                cancel: cancel.clone(),
                slot,
            };
            self.enqueue(PendingOperation::Get(op))?;
            queued.push((volume.name, handle));
        }
        Ok(queued.into_iter().map(move |(name, handle)| {
            let (file, hash, size) = handle.wait()?;
            self.last_read_size.store(size, Ordering::SeqCst);
            Ok((file, hash, size, name))
        }))
    }

    // --- Maintenance operations ---

    /// Delete a remote file. A delete that races a previous successful
    /// delete still resolves as success.
    pub fn delete(
        &self,
        remote_name: &str,
        size: i64,
        wait_for_complete: bool,
        cancel: CancelToken,
    ) -> Result<()> {
        let (slot, handle) = completion();
        let op = operation::DeleteOperation {
            remote_name: remote_name.to_string(),
            size,
            wait_for_complete,
            cancel,
            slot,
        };
        self.enqueue(PendingOperation::Delete(op))?;
        handle.wait()
    }

    /// Enumerate the destination.
    pub fn list(&self, cancel: CancelToken) -> Result<Vec<FileEntry>> {
        let (slot, handle) = completion();
        self.enqueue(PendingOperation::List(operation::ListOperation {
            cancel,
            slot,
        }))?;
        handle.wait()
    }

    /// Capacity information, `None` when the backend cannot report it or
    /// quota queries are disabled.
    pub fn quota_info(&self, cancel: CancelToken) -> Result<Option<QuotaInfo>> {
        let (slot, handle) = completion();
        self.enqueue(PendingOperation::QuotaInfo(operation::QuotaInfoOperation {
            cancel,
            slot,
        }))?;
        handle.wait()
    }

    /// Read a remote file's object-lock expiry. Requires locking support.
    pub fn object_lock_until(
        &self,
        remote_name: &str,
        cancel: CancelToken,
    ) -> Result<Option<DateTime<Utc>>> {
        let (slot, handle) = completion();
        self.enqueue(PendingOperation::GetObjectLock(
            operation::GetObjectLockOperation {
                remote_name: remote_name.to_string(),
                cancel,
                slot,
            },
        ))?;
        handle.wait()
    }

    /// Set a remote file's object-lock expiry. Requires locking support.
    pub fn set_object_lock_until(
        &self,
        remote_name: &str,
        until: DateTime<Utc>,
        cancel: CancelToken,
    ) -> Result<()> {
        let (slot, handle) = completion();
        self.enqueue(PendingOperation::SetObjectLock(
            operation::SetObjectLockOperation {
                remote_name: remote_name.to_string(),
                until,
                cancel,
                slot,
            },
        ))?;
        handle.wait()
    }

    // --- Database synchronization ---

    /// Wait for the queue to drain, flushing collected database entries
    /// on both sides of the barrier.
    pub fn wait_for_empty(
        &self,
        db: &mut dyn VolumeDatabase,
        cancel: CancelToken,
    ) -> Result<()> {
        self.ctx.collector.flush_to(db)?;
        let (slot, handle) = completion();
        self.enqueue(PendingOperation::WaitForEmpty(
            operation::WaitForEmptyOperation { cancel, slot },
        ))?;
        handle.wait()?;
        self.ctx.collector.flush_to(db)?;
        Ok(())
    }

    /// Flush collected database entries without waiting for the queue.
    pub fn flush_pending(&self, db: &mut dyn VolumeDatabase) -> Result<bool> {
        self.ctx.collector.flush_to(db)
    }

    // --- Lifecycle ---

    /// Stop accepting new work. In-flight transfers run to completion;
    /// pending retry waits are cut short.
    pub fn request_stop(&self) {
        self.ctx.soft_cancel.cancel();
    }

    /// Abort in-flight transfers.
    pub fn abort_transfers(&self) {
        self.ctx.hard_cancel.cancel();
    }

    /// Stop the dispatcher and flush pending database entries.
    pub fn stop_and_flush(&self, db: &mut dyn VolumeDatabase) -> Result<()> {
        self.retire();
        self.collect_dispatcher_result(true);
        self.ctx.collector.flush_to(db)?;
        Ok(())
    }

    /// Stop the dispatcher and discard pending database entries.
    pub fn stop_and_discard(&self) {
        self.retire();
        self.collect_dispatcher_result(true);
        self.ctx.collector.clear();
    }

    fn retire(&self) {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Bytes read by the most recent completed get.
    pub fn last_read_size(&self) -> i64 {
        self.last_read_size.load(Ordering::SeqCst)
    }

    /// Bytes written by the most recent completed put with a known size.
    pub fn last_write_size(&self) -> i64 {
        self.last_write_size.load(Ordering::SeqCst)
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        self.retire();

        // Bounded wait for the dispatcher, mirroring its own upload grace
        // period; a stuck dispatcher is logged, not joined forever.
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if let Ok(Err(e)) = handle.join() {
                    warn!("dispatcher terminated with failure: {e}");
                }
            } else {
                warn!("dispatcher did not stop within the grace period");
            }
        }

        // Entries that never reached a database describe remote actions
        // that did happen; they go to the log rather than vanish.
        self.ctx.collector.flush_to_log();
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tracing::{info, warn};

use skiff_storage::Backend;
use skiff_types::error::{Result, SkiffError};
use skiff_types::remote_volume::VolumeState;

use crate::manager::operation::{
    DeleteOperation, GetObjectLockOperation, ListOperation, PendingOperation,
    QuotaInfoOperation, SetObjectLockOperation,
};
use crate::manager::pool::BackendPool;
use crate::manager::progress::TransferEvent;
use crate::manager::ExecuteContext;

/// How long shutdown waits for in-flight uploads before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// The dispatcher: one control loop that admits queued operations under
/// the concurrency rules, executes them with retries against pooled
/// backend connections, and owns shutdown of in-flight work.
///
/// Transfers of one direction parallelize up to their cap; switching
/// direction, or running a barrier operation, first quiesces the other
/// direction. Most backends cannot usefully interleave uploads and
/// downloads on many connections, and operations like list-after-upload
/// need a drain point to be meaningful.
pub(crate) struct Handler {
    ctx: Arc<ExecuteContext>,
    pool: Arc<BackendPool>,
    active_uploads: Vec<JoinHandle<Result<()>>>,
    active_downloads: Vec<JoinHandle<Result<()>>>,
    /// Set once any transfer has fully succeeded in this session; gates
    /// the one-shot folder-autocreate recovery.
    any_transfer_completed: Arc<AtomicBool>,
}

/// Dispatcher thread entry point.
pub(crate) fn run(
    requests: Receiver<PendingOperation>,
    pool: Arc<BackendPool>,
    ctx: Arc<ExecuteContext>,
) -> Result<()> {
    let mut handler = Handler {
        ctx,
        pool,
        active_uploads: Vec::new(),
        active_downloads: Vec::new(),
        any_transfer_completed: Arc::new(AtomicBool::new(false)),
    };
    let result = handler.run_loop(&requests);
    if let Err(e) = &result {
        warn!("dispatcher terminating after unrecoverable failure: {e}");
    }
    handler.shutdown(&requests);
    result
}

impl Handler {
    fn run_loop(&mut self, requests: &Receiver<PendingOperation>) -> Result<()> {
        // The loop ends when the request channel is retired (all senders
        // dropped) or an unrecoverable failure escapes an operation.
        while let Ok(op) = requests.recv() {
            self.process(op)?;
        }
        Ok(())
    }

    fn process(&mut self, op: PendingOperation) -> Result<()> {
        // Reclaim finished uploads first to bound handle growth and to
        // surface any fatal background failure before admitting more work.
        if let Err(e) = Self::drain_finished(&mut self.active_uploads) {
            op.resolve_failed(e.clone_message());
            return Err(e);
        }

        match op {
            PendingOperation::Put(put) if !put.wait_for_complete => {
                // Uploads run in the background once at most one download
                // remains and an upload slot is free.
                if let Err(e) = self.make_room(Direction::Upload) {
                    put.slot.resolve_err(e.clone_message());
                    return Err(e);
                }
                // Admission is the caller-visible completion for
                // fire-and-forget puts, strictly before the upload runs.
                put.resolve_accepted();
                let worker = self.spawn_transfer(PendingOperation::Put(put), "skiff-upload")?;
                self.active_uploads.push(worker);
            }
            PendingOperation::Get(get) => {
                if let Err(e) = self.make_room(Direction::Download) {
                    get.slot.resolve_err(e.clone_message());
                    return Err(e);
                }
                let worker = self.spawn_transfer(PendingOperation::Get(get), "skiff-download")?;
                self.active_downloads.push(worker);
            }
            op => {
                // Barrier: both directions quiesce before the operation
                // runs synchronously.
                if let Err(e) = self.quiesce() {
                    op.resolve_failed(e.clone_message());
                    return Err(e);
                }
                Self::execute_with_retry(
                    op,
                    &self.ctx,
                    &self.pool,
                    &self.any_transfer_completed,
                )?;
            }
        }
        Ok(())
    }

    fn make_room(&mut self, direction: Direction) -> Result<()> {
        match direction {
            Direction::Upload => {
                Self::ensure_at_most(&mut self.active_downloads, 1)?;
                Self::ensure_at_most(
                    &mut self.active_uploads,
                    self.ctx.config.max_parallel_uploads,
                )
            }
            Direction::Download => {
                Self::ensure_at_most(&mut self.active_uploads, 1)?;
                Self::ensure_at_most(
                    &mut self.active_downloads,
                    self.ctx.config.max_parallel_downloads,
                )
            }
        }
    }

    fn quiesce(&mut self) -> Result<()> {
        Self::ensure_at_most(&mut self.active_uploads, 1)?;
        Self::ensure_at_most(&mut self.active_downloads, 1)
    }

    /// Block until fewer than `limit` workers remain in `list`,
    /// propagating the first worker failure.
    fn ensure_at_most(list: &mut Vec<JoinHandle<Result<()>>>, limit: usize) -> Result<()> {
        while list.len() >= limit {
            Self::drain_finished(list)?;
            if list.len() < limit {
                break;
            }
            // Block on the oldest worker; admission order approximates
            // completion order closely enough here.
            let handle = list.remove(0);
            Self::join_worker(handle)?;
        }
        Ok(())
    }

    /// Join every already-finished worker in `list`.
    fn drain_finished(list: &mut Vec<JoinHandle<Result<()>>>) -> Result<()> {
        let mut i = 0;
        while i < list.len() {
            if list[i].is_finished() {
                let handle = list.swap_remove(i);
                Self::join_worker(handle)?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    fn join_worker(handle: JoinHandle<Result<()>>) -> Result<()> {
        handle
            .join()
            .map_err(|_| SkiffError::Other("transfer worker panicked".into()))?
    }

    fn spawn_transfer(
        &self,
        op: PendingOperation,
        name: &str,
    ) -> Result<JoinHandle<Result<()>>> {
        let ctx = Arc::clone(&self.ctx);
        let pool = Arc::clone(&self.pool);
        let any_completed = Arc::clone(&self.any_transfer_completed);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::execute_with_retry(op, &ctx, &pool, &any_completed))?;
        Ok(handle)
    }

    /// Execute an operation with up to `retry_count` attempts.
    ///
    /// Whatever happens, the operation's completion slot is resolved
    /// before this returns. The returned error, if any, is the signal to
    /// terminate the dispatcher: an unrecoverable failure of an operation
    /// nobody waits on. Deletes are exempt; they are idempotent against
    /// "already gone" and safely retried in a later session.
    fn execute_with_retry(
        mut op: PendingOperation,
        ctx: &ExecuteContext,
        pool: &Arc<BackendPool>,
        any_completed: &AtomicBool,
    ) -> Result<()> {
        let max_retries = ctx.config.retry_count;
        let mut last_error: Option<SkiffError> = None;

        for attempt in 1..=max_retries {
            match Self::execute_once(&mut op, ctx, pool) {
                Ok(()) => {
                    if matches!(op, PendingOperation::Put(_) | PendingOperation::Get(_)) {
                        any_completed.store(true, Ordering::SeqCst);
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        operation = %op.kind(),
                        file = %op.remote_name(),
                        size = op.size(),
                        attempt,
                        max_retries,
                        "operation failed: {e}"
                    );

                    if e.is_cancelled()
                        || op.cancel_token().is_cancelled()
                        || ctx.soft_cancel.is_cancelled()
                        || ctx.hard_cancel.is_cancelled()
                        || ctx.abort.is_cancelled()
                    {
                        op.resolve_cancelled();
                        return Ok(());
                    }

                    // Stale DNS entries are a common cause of persistent
                    // connect failures; refresh before the next attempt.
                    if e.is_dns_failure() {
                        Self::refresh_dns_names(pool);
                    }

                    let final_attempt = attempt == max_retries;
                    ctx.progress.send_event(if final_attempt {
                        TransferEvent::Failed {
                            kind: op.kind().as_str(),
                            name: op.remote_name().to_string(),
                        }
                    } else {
                        TransferEvent::Retrying {
                            kind: op.kind().as_str(),
                            name: op.remote_name().to_string(),
                            attempt,
                        }
                    });

                    // A backend without the capability will not grow it on
                    // a retry.
                    if matches!(e, SkiffError::Unsupported(_)) {
                        last_error = Some(e);
                        break;
                    }

                    let mut recovered = false;
                    if !any_completed.load(Ordering::SeqCst)
                        && ctx.config.autocreate_folders
                        && e.is_folder_missing()
                    {
                        recovered = Self::try_create_folder(pool);
                    }
                    last_error = Some(e);

                    if !recovered && !final_attempt && ctx.config.retry_delay_ms > 0 {
                        let delay = ctx.config.retry_delay_for_attempt(attempt);
                        if ctx.soft_cancel.wait_timeout(delay) {
                            op.resolve_cancelled();
                            return Ok(());
                        }
                    }
                }
            }
        }

        if let Some(e) = last_error {
            op.resolve_failed(e.clone_message());
            if !op.wait_for_complete() && !op.is_delete() {
                return Err(e);
            }
        }
        Ok(())
    }

    fn execute_once(
        op: &mut PendingOperation,
        ctx: &ExecuteContext,
        pool: &Arc<BackendPool>,
    ) -> Result<()> {
        // The queue-drain barrier itself needs no backend connection.
        if let PendingOperation::WaitForEmpty(wait) = op {
            wait.slot.resolve_ok(());
            return Ok(());
        }

        let mut handle = pool.acquire()?;
        let result = Self::dispatch(op, handle.backend(), ctx);
        if result.is_err() {
            handle.prevent_reuse();
        }
        result
    }

    /// Fan-out to per-operation execution. A new operation kind means a
    /// new arm here; the compiler enforces exhaustiveness.
    fn dispatch(
        op: &mut PendingOperation,
        backend: &dyn Backend,
        ctx: &ExecuteContext,
    ) -> Result<()> {
        match op {
            PendingOperation::Put(put) => put.execute(backend, ctx),
            PendingOperation::Get(get) => get.execute(backend, ctx),
            PendingOperation::Delete(delete) => Self::execute_delete(delete, backend, ctx),
            PendingOperation::List(list) => Self::execute_list(list, backend, ctx),
            PendingOperation::QuotaInfo(quota) => Self::execute_quota(quota, backend, ctx),
            PendingOperation::GetObjectLock(get_lock) => {
                Self::execute_get_lock(get_lock, backend)
            }
            PendingOperation::SetObjectLock(set_lock) => {
                Self::execute_set_lock(set_lock, backend, ctx)
            }
            PendingOperation::WaitForEmpty(wait) => {
                wait.slot.resolve_ok(());
                Ok(())
            }
        }
    }

    fn execute_delete(
        op: &DeleteOperation,
        backend: &dyn Backend,
        ctx: &ExecuteContext,
    ) -> Result<()> {
        if !op.wait_for_complete {
            op.slot.resolve_ok(());
        }
        ctx.progress.send_event(TransferEvent::Started {
            kind: "delete",
            name: op.remote_name.clone(),
            size: op.size,
        });

        match backend.delete(&op.remote_name) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                // The file may be gone already, e.g. from a prior attempt
                // whose response was lost. Only the listing decides.
                info!(
                    "delete of '{}' reported not-found, listing contents",
                    op.remote_name
                );
                let still_present = match backend.list() {
                    Ok(entries) => entries.iter().any(|f| f.name == op.remote_name),
                    Err(_) => true,
                };
                if still_present {
                    warn!("listing confirms '{}' was not deleted", op.remote_name);
                    ctx.collector
                        .log_operation("delete", &op.remote_name, &e.to_string());
                    return Err(e);
                }
                info!(
                    "listing indicates '{}' was already deleted",
                    op.remote_name
                );
            }
            Err(e) => {
                ctx.collector
                    .log_operation("delete", &op.remote_name, &e.to_string());
                return Err(e);
            }
        }

        ctx.collector.log_operation("delete", &op.remote_name, "");
        ctx.collector
            .log_volume_update(&op.remote_name, VolumeState::Deleted, -1, None);
        ctx.progress.send_event(TransferEvent::Completed {
            kind: "delete",
            name: op.remote_name.clone(),
            size: op.size,
        });
        op.slot.resolve_ok(());
        Ok(())
    }

    fn execute_list(
        op: &ListOperation,
        backend: &dyn Backend,
        ctx: &ExecuteContext,
    ) -> Result<()> {
        ctx.progress.send_event(TransferEvent::Started {
            kind: "list",
            name: String::new(),
            size: -1,
        });
        let entries = backend.list()?;
        let serialized = serde_json::to_string(&entries)
            .map_err(|e| SkiffError::Other(format!("listing serialization: {e}")))?;
        ctx.collector.log_operation("list", "", &serialized);
        ctx.progress.send_event(TransferEvent::Completed {
            kind: "list",
            name: String::new(),
            size: entries.len() as i64,
        });
        op.slot.resolve_ok(entries);
        Ok(())
    }

    fn execute_quota(
        op: &QuotaInfoOperation,
        backend: &dyn Backend,
        ctx: &ExecuteContext,
    ) -> Result<()> {
        if ctx.config.disable_quota_info {
            op.slot.resolve_ok(None);
            return Ok(());
        }
        let info = match backend.as_quota() {
            Some(quota) => Some(quota.quota_info()?),
            None => None,
        };
        op.slot.resolve_ok(info);
        Ok(())
    }

    fn execute_get_lock(op: &GetObjectLockOperation, backend: &dyn Backend) -> Result<()> {
        let locking = backend.as_locking().ok_or_else(|| {
            SkiffError::Unsupported("backend does not support object locks".into())
        })?;
        op.slot
            .resolve_ok(locking.object_lock_until(&op.remote_name)?);
        Ok(())
    }

    fn execute_set_lock(
        op: &SetObjectLockOperation,
        backend: &dyn Backend,
        ctx: &ExecuteContext,
    ) -> Result<()> {
        let locking = backend.as_locking().ok_or_else(|| {
            SkiffError::Unsupported("backend does not support object locks".into())
        })?;
        locking.set_object_lock_until(&op.remote_name, op.until)?;
        ctx.collector.log_operation(
            "setobjectlock",
            &op.remote_name,
            &op.until.to_rfc3339(),
        );
        op.slot.resolve_ok(());
        Ok(())
    }

    /// Re-resolve the names the backend connects to. Best-effort: a
    /// failure here only means the retry proceeds with whatever the
    /// resolver has.
    fn refresh_dns_names(pool: &Arc<BackendPool>) {
        let Ok(mut handle) = pool.acquire() else {
            return;
        };
        match handle.backend().dns_names() {
            Ok(names) => {
                for name in names {
                    let name = name.trim();
                    if !name.is_empty() {
                        use std::net::ToSocketAddrs;
                        let _ = (name, 443).to_socket_addrs();
                    }
                }
            }
            Err(_) => handle.prevent_reuse(),
        }
    }

    /// One-shot folder creation after a folder-missing failure.
    fn try_create_folder(pool: &Arc<BackendPool>) -> bool {
        let mut handle = match pool.acquire() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("failed to create folder: {e}");
                return false;
            }
        };
        match handle.backend().create_folder() {
            Ok(()) => {
                info!("created missing destination folder");
                true
            }
            Err(e) => {
                handle.prevent_reuse();
                warn!("failed to create folder: {e}");
                false
            }
        }
    }

    fn shutdown(&mut self, requests: &Receiver<PendingOperation>) {
        // Stop in-flight transfers and fail anything still queued fast.
        self.ctx.abort.cancel();
        while let Ok(op) = requests.try_recv() {
            op.resolve_failed(SkiffError::Other("backend manager is stopped".into()));
        }

        if !self.active_uploads.is_empty() {
            warn!(
                count = self.active_uploads.len(),
                "terminating active uploads"
            );
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            while !self.active_uploads.is_empty() && Instant::now() < deadline {
                let mut i = 0;
                while i < self.active_uploads.len() {
                    if self.active_uploads[i].is_finished() {
                        let handle = self.active_uploads.swap_remove(i);
                        if let Err(e) = Self::join_worker(handle) {
                            warn!("error in active upload during shutdown: {e}");
                        }
                    } else {
                        i += 1;
                    }
                }
                if !self.active_uploads.is_empty() {
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
            if !self.active_uploads.is_empty() {
                warn!(
                    count = self.active_uploads.len(),
                    "abandoning uploads still active after grace period"
                );
                self.active_uploads.clear();
            }
        }

        // Download failures are observed by their waiting callers through
        // the completion slots; the worker threads wind down on their own.
        self.active_downloads.clear();

        self.pool.drain();
    }
}

enum Direction {
    Upload,
    Download,
}

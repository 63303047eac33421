use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tempfile::TempPath;

use skiff_types::error::{Result, SkiffError};
use skiff_types::remote_volume::{FileEntry, QuotaInfo};

use crate::cancel::CancelToken;
use crate::manager::get::GetOperation;
use crate::manager::put::PutOperation;

/// One-shot completion signal for a queued operation.
///
/// The first resolution wins; later calls are no-ops. This holds
/// regardless of races between normal completion and forced failure
/// paths, so an operation's caller observes exactly one outcome.
pub(crate) struct CompletionSlot<T> {
    tx: crossbeam_channel::Sender<Result<T>>,
    resolved: AtomicBool,
}

/// The caller's end of a [`CompletionSlot`].
pub(crate) struct CompletionHandle<T> {
    rx: crossbeam_channel::Receiver<Result<T>>,
}

pub(crate) fn completion<T>() -> (CompletionSlot<T>, CompletionHandle<T>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (
        CompletionSlot {
            tx,
            resolved: AtomicBool::new(false),
        },
        CompletionHandle { rx },
    )
}

impl<T> CompletionSlot<T> {
    pub fn resolve_ok(&self, value: T) {
        self.resolve(Ok(value));
    }

    pub fn resolve_err(&self, err: SkiffError) {
        self.resolve(Err(err));
    }

    pub fn resolve_cancelled(&self) {
        self.resolve(Err(SkiffError::Cancelled));
    }

    fn resolve(&self, result: Result<T>) {
        if !self.resolved.swap(true, Ordering::SeqCst) {
            // The receiver may already be gone (fire-and-forget caller).
            let _ = self.tx.send(result);
        }
    }
}

impl<T> Drop for CompletionSlot<T> {
    fn drop(&mut self) {
        // An operation dropped unresolved (e.g. still queued when the
        // dispatcher died) must not leave its caller blocked forever.
        self.resolve(Err(SkiffError::Other(
            "operation abandoned: backend manager is stopped".into(),
        )));
    }
}

impl<T> CompletionHandle<T> {
    /// Block until the operation resolves.
    pub fn wait(self) -> Result<T> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(SkiffError::Other(
                "operation abandoned: backend manager is stopped".into(),
            )),
        }
    }
}

/// The kind tag for an operation, used in logs and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Put,
    Get,
    Delete,
    List,
    QuotaInfo,
    GetObjectLock,
    SetObjectLock,
    WaitForEmpty,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Put => "put",
            OperationKind::Get => "get",
            OperationKind::Delete => "delete",
            OperationKind::List => "list",
            OperationKind::QuotaInfo => "quotainfo",
            OperationKind::GetObjectLock => "getobjectlock",
            OperationKind::SetObjectLock => "setobjectlock",
            OperationKind::WaitForEmpty => "waitforempty",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) struct DeleteOperation {
    pub remote_name: String,
    pub size: i64,
    pub wait_for_complete: bool,
    pub cancel: CancelToken,
    pub slot: CompletionSlot<()>,
}

pub(crate) struct ListOperation {
    pub cancel: CancelToken,
    pub slot: CompletionSlot<Vec<FileEntry>>,
}

pub(crate) struct QuotaInfoOperation {
    pub cancel: CancelToken,
    pub slot: CompletionSlot<Option<QuotaInfo>>,
}

pub(crate) struct GetObjectLockOperation {
    pub remote_name: String,
    pub cancel: CancelToken,
    pub slot: CompletionSlot<Option<DateTime<Utc>>>,
}

pub(crate) struct SetObjectLockOperation {
    pub remote_name: String,
    pub until: DateTime<Utc>,
    pub cancel: CancelToken,
    pub slot: CompletionSlot<()>,
}

pub(crate) struct WaitForEmptyOperation {
    pub cancel: CancelToken,
    pub slot: CompletionSlot<()>,
}

/// The closed set of operations the dispatcher understands.
///
/// Adding a new operation kind means adding a variant here and an arm to
/// the dispatcher's execute match; the compiler enforces the rest.
pub(crate) enum PendingOperation {
    Put(PutOperation),
    Get(GetOperation),
    Delete(DeleteOperation),
    List(ListOperation),
    QuotaInfo(QuotaInfoOperation),
    GetObjectLock(GetObjectLockOperation),
    SetObjectLock(SetObjectLockOperation),
    WaitForEmpty(WaitForEmptyOperation),
}

impl PendingOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            PendingOperation::Put(_) => OperationKind::Put,
            PendingOperation::Get(_) => OperationKind::Get,
            PendingOperation::Delete(_) => OperationKind::Delete,
            PendingOperation::List(_) => OperationKind::List,
            PendingOperation::QuotaInfo(_) => OperationKind::QuotaInfo,
            PendingOperation::GetObjectLock(_) => OperationKind::GetObjectLock,
            PendingOperation::SetObjectLock(_) => OperationKind::SetObjectLock,
            PendingOperation::WaitForEmpty(_) => OperationKind::WaitForEmpty,
        }
    }

    /// Remote filename, empty for operations without one.
    pub fn remote_name(&self) -> &str {
        match self {
            PendingOperation::Put(op) => op.remote_name(),
            PendingOperation::Get(op) => &op.remote_name,
            PendingOperation::Delete(op) => &op.remote_name,
            PendingOperation::GetObjectLock(op) => &op.remote_name,
            PendingOperation::SetObjectLock(op) => &op.remote_name,
            _ => "",
        }
    }

    /// Expected transfer size, -1 if unknown or not applicable.
    pub fn size(&self) -> i64 {
        match self {
            PendingOperation::Put(op) => op.known_size(),
            PendingOperation::Get(op) => op.size,
            PendingOperation::Delete(op) => op.size,
            _ => -1,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        match self {
            PendingOperation::Put(op) => &op.cancel,
            PendingOperation::Get(op) => &op.cancel,
            PendingOperation::Delete(op) => &op.cancel,
            PendingOperation::List(op) => &op.cancel,
            PendingOperation::QuotaInfo(op) => &op.cancel,
            PendingOperation::GetObjectLock(op) => &op.cancel,
            PendingOperation::SetObjectLock(op) => &op.cancel,
            PendingOperation::WaitForEmpty(op) => &op.cancel,
        }
    }

    /// Whether the queueing caller waits for the full result rather than
    /// just acceptance.
    pub fn wait_for_complete(&self) -> bool {
        match self {
            PendingOperation::Put(op) => op.wait_for_complete,
            PendingOperation::Delete(op) => op.wait_for_complete,
            // Gets and the remaining barrier operations always produce a
            // value, so their callers always wait.
            _ => true,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PendingOperation::Delete(_))
    }

    pub fn resolve_failed(&self, err: SkiffError) {
        match self {
            PendingOperation::Put(op) => op.slot.resolve_err(err),
            PendingOperation::Get(op) => op.slot.resolve_err(err),
            PendingOperation::Delete(op) => op.slot.resolve_err(err),
            PendingOperation::List(op) => op.slot.resolve_err(err),
            PendingOperation::QuotaInfo(op) => op.slot.resolve_err(err),
            PendingOperation::GetObjectLock(op) => op.slot.resolve_err(err),
            PendingOperation::SetObjectLock(op) => op.slot.resolve_err(err),
            PendingOperation::WaitForEmpty(op) => op.slot.resolve_err(err),
        }
    }

    pub fn resolve_cancelled(&self) {
        match self {
            PendingOperation::Put(op) => op.slot.resolve_cancelled(),
            PendingOperation::Get(op) => op.slot.resolve_cancelled(),
            PendingOperation::Delete(op) => op.slot.resolve_cancelled(),
            PendingOperation::List(op) => op.slot.resolve_cancelled(),
            PendingOperation::QuotaInfo(op) => op.slot.resolve_cancelled(),
            PendingOperation::GetObjectLock(op) => op.slot.resolve_cancelled(),
            PendingOperation::SetObjectLock(op) => op.slot.resolve_cancelled(),
            PendingOperation::WaitForEmpty(op) => op.slot.resolve_cancelled(),
        }
    }
}

/// Result payload of a completed get: the downloaded (and possibly
/// decrypted) file, its hash, and the byte count that came off the wire.
pub(crate) type DownloadedFile = (TempPath, String, i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_resolves_exactly_once() {
        let (slot, handle) = completion::<i32>();
        slot.resolve_ok(1);
        slot.resolve_ok(2);
        slot.resolve_err(SkiffError::Cancelled);
        assert_eq!(handle.wait().unwrap(), 1);
    }

    #[test]
    fn failure_and_success_race_yields_one_outcome() {
        let (slot, handle) = completion::<&'static str>();
        slot.resolve_err(SkiffError::Backend("boom".into()));
        slot.resolve_ok("late");
        match handle.wait() {
            Err(SkiffError::Backend(m)) => assert_eq!(m, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn dropping_unresolved_slot_unblocks_the_caller() {
        let (slot, handle) = completion::<()>();
        drop(slot);
        assert!(handle.wait().is_err());
    }

    #[test]
    fn resolution_with_dropped_receiver_is_silent() {
        let (slot, handle) = completion::<()>();
        drop(handle);
        slot.resolve_ok(());
    }
}

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use skiff_storage::{Backend, LockingBackend, QuotaBackend, StreamingBackend};
use skiff_types::error::{Result, SkiffError};
use skiff_types::remote_volume::{FileEntry, QuotaInfo, VolumeState};

use crate::config::TransferConfig;
use crate::database::VolumeDatabase;
use crate::manager::{BackendFactory, TransferManager};

/// In-memory storage backend for tests. Clones share state, so one
/// instance can serve as the factory for many pooled connections while
/// tests inspect and script it from outside.
#[derive(Clone)]
pub(crate) struct MemoryBackend {
    state: Arc<MemoryBackendState>,
}

struct MemoryBackendState {
    files: Mutex<HashMap<String, Vec<u8>>>,
    locks: Mutex<HashMap<String, DateTime<Utc>>>,
    put_attempts: Mutex<Vec<String>>,

    /// Fail this many put attempts before succeeding.
    fail_next_puts: AtomicUsize,
    fail_all_puts: AtomicBool,
    fail_all_deletes: AtomicBool,

    /// Artificial transfer duration, for concurrency observation.
    transfer_delay_ms: AtomicUsize,

    active_puts: AtomicUsize,
    peak_puts: AtomicUsize,
    active_gets: AtomicUsize,
    peak_gets: AtomicUsize,
    put_get_overlap: AtomicBool,
    listed_during_transfer: AtomicBool,

    locking_enabled: bool,
    quota: Option<QuotaInfo>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::build(false, None)
    }

    pub fn with_locking() -> Self {
        Self::build(true, None)
    }

    pub fn with_quota(quota: QuotaInfo) -> Self {
        Self::build(false, Some(quota))
    }

    fn build(locking_enabled: bool, quota: Option<QuotaInfo>) -> Self {
        Self {
            state: Arc::new(MemoryBackendState {
                files: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                put_attempts: Mutex::new(Vec::new()),
                fail_next_puts: AtomicUsize::new(0),
                fail_all_puts: AtomicBool::new(false),
                fail_all_deletes: AtomicBool::new(false),
                transfer_delay_ms: AtomicUsize::new(0),
                active_puts: AtomicUsize::new(0),
                peak_puts: AtomicUsize::new(0),
                active_gets: AtomicUsize::new(0),
                peak_gets: AtomicUsize::new(0),
                put_get_overlap: AtomicBool::new(false),
                listed_during_transfer: AtomicBool::new(false),
                locking_enabled,
                quota,
            }),
        }
    }

    // --- Scripting ---

    pub fn seed(&self, name: &str, content: &[u8]) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(name.to_string(), content.to_vec());
    }

    pub fn fail_next_puts(&self, count: usize) {
        self.state.fail_next_puts.store(count, Ordering::SeqCst);
    }

    pub fn fail_all_puts(&self) {
        self.state.fail_all_puts.store(true, Ordering::SeqCst);
    }

    pub fn fail_all_deletes(&self) {
        self.state.fail_all_deletes.store(true, Ordering::SeqCst);
    }

    pub fn set_transfer_delay(&self, delay: Duration) {
        self.state
            .transfer_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    // --- Observation ---

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.state.files.lock().unwrap().get(name).cloned()
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.files.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn put_attempts(&self) -> Vec<String> {
        self.state.put_attempts.lock().unwrap().clone()
    }

    pub fn peak_puts(&self) -> usize {
        self.state.peak_puts.load(Ordering::SeqCst)
    }

    pub fn peak_gets(&self) -> usize {
        self.state.peak_gets.load(Ordering::SeqCst)
    }

    pub fn saw_put_get_overlap(&self) -> bool {
        self.state.put_get_overlap.load(Ordering::SeqCst)
    }

    pub fn saw_list_during_transfer(&self) -> bool {
        self.state.listed_during_transfer.load(Ordering::SeqCst)
    }

    // --- Internals ---

    fn delay(&self) {
        let ms = self.state.transfer_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms as u64));
        }
    }

    fn begin_put(&self) -> ActiveGuard<'_> {
        let guard = ActiveGuard::enter(&self.state.active_puts, &self.state.peak_puts);
        if self.state.active_gets.load(Ordering::SeqCst) > 0 {
            self.state.put_get_overlap.store(true, Ordering::SeqCst);
        }
        guard
    }

    fn begin_get(&self) -> ActiveGuard<'_> {
        let guard = ActiveGuard::enter(&self.state.active_gets, &self.state.peak_gets);
        if self.state.active_puts.load(Ordering::SeqCst) > 0 {
            self.state.put_get_overlap.store(true, Ordering::SeqCst);
        }
        guard
    }

    fn check_put_failures(&self) -> Result<()> {
        if self.state.fail_all_puts.load(Ordering::SeqCst) {
            return Err(SkiffError::Backend("injected put failure".into()));
        }
        let failed = self
            .state
            .fail_next_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SkiffError::Backend("injected put failure".into()));
        }
        Ok(())
    }

    fn store_put(&self, remotename: &str, content: Vec<u8>) -> Result<()> {
        let _guard = self.begin_put();
        self.state
            .put_attempts
            .lock()
            .unwrap()
            .push(remotename.to_string());
        self.delay();
        self.check_put_failures()?;
        self.state
            .files
            .lock()
            .unwrap()
            .insert(remotename.to_string(), content);
        Ok(())
    }
}

struct ActiveGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Backend for MemoryBackend {
    fn display_name(&self) -> &str {
        "memory"
    }

    fn list(&self) -> Result<Vec<FileEntry>> {
        let transfers_active = self.state.active_puts.load(Ordering::SeqCst)
            + self.state.active_gets.load(Ordering::SeqCst);
        if transfers_active > 0 {
            self.state
                .listed_during_transfer
                .store(true, Ordering::SeqCst);
        }
        let files = self.state.files.lock().unwrap();
        let mut entries: Vec<FileEntry> = files
            .iter()
            .map(|(name, content)| FileEntry::file(name.clone(), content.len() as i64))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn put(&self, remotename: &str, local: &Path) -> Result<()> {
        let content = std::fs::read(local)?;
        self.store_put(remotename, content)
    }

    fn get(&self, remotename: &str, local: &Path) -> Result<()> {
        let _guard = self.begin_get();
        self.delay();
        let content = self
            .file(remotename)
            .ok_or_else(|| SkiffError::FileMissing(remotename.to_string()))?;
        std::fs::write(local, content)?;
        Ok(())
    }

    fn delete(&self, remotename: &str) -> Result<()> {
        if self.state.fail_all_deletes.load(Ordering::SeqCst) {
            return Err(SkiffError::Backend("injected delete failure".into()));
        }
        match self.state.files.lock().unwrap().remove(remotename) {
            Some(_) => Ok(()),
            None => Err(SkiffError::FileMissing(remotename.to_string())),
        }
    }

    fn create_folder(&self) -> Result<()> {
        Ok(())
    }

    fn as_streaming(&self) -> Option<&dyn StreamingBackend> {
        Some(self)
    }

    fn as_quota(&self) -> Option<&dyn QuotaBackend> {
        self.state.quota.map(|_| self as &dyn QuotaBackend)
    }

    fn as_locking(&self) -> Option<&dyn LockingBackend> {
        self.state
            .locking_enabled
            .then_some(self as &dyn LockingBackend)
    }
}

impl StreamingBackend for MemoryBackend {
    fn put_stream(&self, remotename: &str, source: &mut dyn Read) -> Result<()> {
        let mut content = Vec::new();
        source.read_to_end(&mut content)?;
        self.store_put(remotename, content)
    }

    fn get_stream(&self, remotename: &str, target: &mut dyn Write) -> Result<()> {
        let _guard = self.begin_get();
        self.delay();
        let content = self
            .file(remotename)
            .ok_or_else(|| SkiffError::FileMissing(remotename.to_string()))?;
        target.write_all(&content)?;
        target.flush()?;
        Ok(())
    }
}

impl QuotaBackend for MemoryBackend {
    fn quota_info(&self) -> Result<QuotaInfo> {
        self.state
            .quota
            .ok_or_else(|| SkiffError::Unsupported("no quota configured".into()))
    }
}

impl LockingBackend for MemoryBackend {
    fn object_lock_until(&self, remotename: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.locks.lock().unwrap().get(remotename).copied())
    }

    fn set_object_lock_until(&self, remotename: &str, until: DateTime<Utc>) -> Result<()> {
        self.state
            .locks
            .lock()
            .unwrap()
            .insert(remotename.to_string(), until);
        Ok(())
    }
}

/// Recording database for tests.
pub(crate) struct MemoryDatabase {
    calls: Vec<DatabaseCall>,
    fail_renames: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DatabaseCall {
    Begin,
    Commit,
    Rollback,
    LogOperation {
        action: String,
        file: String,
        result: String,
    },
    UpdateVolume {
        name: String,
        state: VolumeState,
        size: i64,
        hash: Option<String>,
    },
    UpdateVolumeWithGrace {
        name: String,
        state: VolumeState,
        size: i64,
        hash: Option<String>,
        grace: Duration,
    },
    Rename {
        old: String,
        new: String,
    },
    RemoveVolumes {
        names: Vec<String>,
    },
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            fail_renames: false,
        }
    }

    pub fn fail_renames(&mut self) {
        self.fail_renames = true;
    }

    pub fn calls(&self) -> Vec<DatabaseCall> {
        self.calls.clone()
    }

    pub fn renames(&self) -> Vec<(String, String)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                DatabaseCall::Rename { old, new } => Some((old.clone(), new.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn volume_updates(&self) -> Vec<(String, VolumeState)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                DatabaseCall::UpdateVolume { name, state, .. } => Some((name.clone(), *state)),
                DatabaseCall::UpdateVolumeWithGrace { name, state, .. } => {
                    Some((name.clone(), *state))
                }
                _ => None,
            })
            .collect()
    }
}

impl VolumeDatabase for MemoryDatabase {
    fn begin_transaction(&mut self) -> Result<()> {
        self.calls.push(DatabaseCall::Begin);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.calls.push(DatabaseCall::Commit);
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.calls.push(DatabaseCall::Rollback);
        Ok(())
    }

    fn log_remote_operation(&mut self, action: &str, file: &str, result: &str) -> Result<()> {
        self.calls.push(DatabaseCall::LogOperation {
            action: action.to_string(),
            file: file.to_string(),
            result: result.to_string(),
        });
        Ok(())
    }

    fn update_remote_volume(
        &mut self,
        name: &str,
        state: VolumeState,
        size: i64,
        hash: Option<&str>,
    ) -> Result<()> {
        self.calls.push(DatabaseCall::UpdateVolume {
            name: name.to_string(),
            state,
            size,
            hash: hash.map(str::to_string),
        });
        Ok(())
    }

    fn update_remote_volume_with_grace(
        &mut self,
        name: &str,
        state: VolumeState,
        size: i64,
        hash: Option<&str>,
        grace: Duration,
    ) -> Result<()> {
        self.calls.push(DatabaseCall::UpdateVolumeWithGrace {
            name: name.to_string(),
            state,
            size,
            hash: hash.map(str::to_string),
            grace,
        });
        Ok(())
    }

    fn rename_remote_volume(&mut self, old: &str, new: &str) -> Result<()> {
        if self.fail_renames {
            return Err(SkiffError::Database("injected rename failure".into()));
        }
        self.calls.push(DatabaseCall::Rename {
            old: old.to_string(),
            new: new.to_string(),
        });
        Ok(())
    }

    fn remove_remote_volumes(&mut self, names: &[String]) -> Result<()> {
        self.calls.push(DatabaseCall::RemoveVolumes {
            names: names.to_vec(),
        });
        Ok(())
    }
}

// --- Manager helpers ---

/// Config tuned for tests: unencrypted, no retry delays.
pub(crate) fn test_config() -> TransferConfig {
    TransferConfig {
        no_encryption: true,
        retry_count: 2,
        retry_delay_ms: 0,
        ..TransferConfig::default()
    }
}

pub(crate) fn manager_with(backend: &MemoryBackend, config: TransferConfig) -> TransferManager {
    let template = backend.clone();
    let factory: BackendFactory = Box::new(move || Ok(Box::new(template.clone())));
    TransferManager::with_backend_factory(factory, config, None).unwrap()
}

/// A temp file with the given content, for uploads.
pub(crate) fn temp_file_with(content: &[u8]) -> tempfile::TempPath {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content).unwrap();
    file.flush().unwrap();
    file.into_temp_path()
}

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{error, warn};

use skiff_types::error::Result;
use skiff_types::remote_volume::VolumeState;

use crate::database::VolumeDatabase;

/// How long a `Deleted` record is retained before cleanup, to cover
/// backends with delayed listing consistency.
const DELETE_GRACE: Duration = Duration::from_secs(2 * 60 * 60);

/// A remote-state mutation waiting to be written to the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PendingDatabaseEntry {
    Operation {
        action: String,
        file: String,
        result: String,
    },
    VolumeUpdate {
        name: String,
        state: VolumeState,
        size: i64,
        hash: Option<String>,
    },
    Rename {
        old: String,
        new: String,
    },
}

/// Buffers remote-state mutations produced during operation execution so
/// producers never block on database I/O. Entries are swapped out
/// atomically and applied in production order on flush.
///
/// Entries describe actions that already happened against the remote, so
/// they are never silently discarded: if the database is unreachable at
/// teardown they go to the application log instead.
pub(crate) struct DatabaseCollector {
    queue: Mutex<Vec<PendingDatabaseEntry>>,
}

impl DatabaseCollector {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn log_operation(&self, action: &str, file: &str, result: &str) {
        self.push(PendingDatabaseEntry::Operation {
            action: action.to_string(),
            file: file.to_string(),
            result: result.to_string(),
        });
    }

    pub fn log_volume_update(&self, name: &str, state: VolumeState, size: i64, hash: Option<&str>) {
        self.push(PendingDatabaseEntry::VolumeUpdate {
            name: name.to_string(),
            state,
            size,
            hash: hash.map(str::to_string),
        });
    }

    pub fn log_rename(&self, old: &str, new: &str) {
        self.push(PendingDatabaseEntry::Rename {
            old: old.to_string(),
            new: new.to_string(),
        });
    }

    fn push(&self, entry: PendingDatabaseEntry) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    pub fn has_pending(&self) -> bool {
        !self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    fn take_all(&self) -> Vec<PendingDatabaseEntry> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Apply all buffered entries to the database inside one transaction.
    /// Returns `true` if anything was written.
    pub fn flush_to(&self, db: &mut dyn VolumeDatabase) -> Result<bool> {
        let entries = self.take_all();
        if entries.is_empty() {
            return Ok(false);
        }

        db.begin_transaction()?;
        match Self::apply(db, &entries) {
            Ok(()) => {
                db.commit()?;
                Ok(true)
            }
            Err(e) => {
                if let Err(rb) = db.rollback() {
                    warn!("rollback after flush failure also failed: {rb}");
                }
                // The entries describe completed remote actions; make sure
                // they survive somewhere before surfacing the error.
                Self::write_to_log(&entries);
                Err(e)
            }
        }
    }

    fn apply(db: &mut dyn VolumeDatabase, entries: &[PendingDatabaseEntry]) -> Result<()> {
        // Deleted volumes accumulate into one removal pass that runs after
        // every entry has been applied.
        let mut removed: HashSet<String> = HashSet::new();

        for entry in entries {
            match entry {
                PendingDatabaseEntry::Operation {
                    action,
                    file,
                    result,
                } => db.log_remote_operation(action, file, result)?,
                PendingDatabaseEntry::VolumeUpdate {
                    name,
                    state: VolumeState::Deleted,
                    size,
                    hash,
                } => {
                    db.update_remote_volume_with_grace(
                        name,
                        VolumeState::Deleted,
                        *size,
                        hash.as_deref(),
                        DELETE_GRACE,
                    )?;
                    removed.insert(name.clone());
                }
                PendingDatabaseEntry::VolumeUpdate {
                    name,
                    state,
                    size,
                    hash,
                } => db.update_remote_volume(name, *state, *size, hash.as_deref())?,
                PendingDatabaseEntry::Rename { old, new } => db.rename_remote_volume(old, new)?,
            }
        }

        if !removed.is_empty() {
            let names: Vec<String> = removed.into_iter().collect();
            db.remove_remote_volumes(&names)?;
        }
        Ok(())
    }

    /// Write buffered entries to the application log. Used when teardown
    /// happens before any database flush: the remote actions did happen
    /// even though they could not be recorded.
    pub fn flush_to_log(&self) {
        let entries = self.take_all();
        if !entries.is_empty() {
            warn!(
                count = entries.len(),
                "database unavailable, logging unrecorded remote actions"
            );
            Self::write_to_log(&entries);
        }
    }

    fn write_to_log(entries: &[PendingDatabaseEntry]) {
        for entry in entries {
            match entry {
                PendingDatabaseEntry::Operation {
                    action,
                    file,
                    result,
                } => error!("unrecorded remote operation: {action} {file} {result}"),
                PendingDatabaseEntry::VolumeUpdate {
                    name,
                    state,
                    size,
                    hash,
                } => error!(
                    "unrecorded volume state: {name} -> {state} (size {size}, hash {})",
                    hash.as_deref().unwrap_or("-")
                ),
                PendingDatabaseEntry::Rename { old, new } => {
                    error!("unrecorded remote rename: {old} -> {new}")
                }
            }
        }
    }

    /// Discard buffered entries without recording them anywhere.
    pub fn clear(&self) {
        self.take_all();
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<PendingDatabaseEntry> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{DatabaseCall, MemoryDatabase};

    #[test]
    fn entries_apply_in_production_order() {
        let collector = DatabaseCollector::new();
        collector.log_volume_update("vol-a", VolumeState::Uploading, 10, None);
        collector.log_operation("put", "vol-a", "{}");
        collector.log_rename("vol-a", "vol-b");
        collector.log_volume_update("vol-b", VolumeState::Uploaded, 10, Some("h"));

        let mut db = MemoryDatabase::new();
        assert!(collector.flush_to(&mut db).unwrap());

        let calls = db.calls();
        assert_eq!(calls[0], DatabaseCall::Begin);
        assert!(matches!(calls[1], DatabaseCall::UpdateVolume { ref name, .. } if name == "vol-a"));
        assert!(matches!(calls[2], DatabaseCall::LogOperation { ref action, .. } if action == "put"));
        assert!(matches!(calls[3], DatabaseCall::Rename { ref old, ref new } if old == "vol-a" && new == "vol-b"));
        assert!(matches!(calls[4], DatabaseCall::UpdateVolume { ref name, .. } if name == "vol-b"));
        assert_eq!(*calls.last().unwrap(), DatabaseCall::Commit);

        // Buffer was swapped out; a second flush writes nothing.
        assert!(!collector.flush_to(&mut db).unwrap());
    }

    #[test]
    fn deletes_use_grace_and_batch_into_removal() {
        let collector = DatabaseCollector::new();
        collector.log_volume_update("gone-1", VolumeState::Deleted, -1, None);
        collector.log_volume_update("kept", VolumeState::Uploaded, 5, None);
        collector.log_volume_update("gone-2", VolumeState::Deleted, -1, None);

        let mut db = MemoryDatabase::new();
        collector.flush_to(&mut db).unwrap();

        let graced: Vec<_> = db
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                DatabaseCall::UpdateVolumeWithGrace { name, grace, .. } => Some((name, grace)),
                _ => None,
            })
            .collect();
        assert_eq!(graced.len(), 2);
        assert!(graced.iter().all(|(_, g)| *g == DELETE_GRACE));

        let removals: Vec<_> = db
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                DatabaseCall::RemoveVolumes { mut names } => {
                    names.sort();
                    Some(names)
                }
                _ => None,
            })
            .collect();
        assert_eq!(removals, vec![vec!["gone-1".to_string(), "gone-2".to_string()]]);
    }

    #[test]
    fn failed_flush_rolls_back() {
        let collector = DatabaseCollector::new();
        collector.log_rename("a", "b");

        let mut db = MemoryDatabase::new();
        db.fail_renames();
        assert!(collector.flush_to(&mut db).is_err());
        assert_eq!(*db.calls().last().unwrap(), DatabaseCall::Rollback);
    }

    #[test]
    fn clear_discards_everything() {
        let collector = DatabaseCollector::new();
        collector.log_operation("list", "", "[]");
        assert!(collector.has_pending());
        collector.clear();
        assert!(!collector.has_pending());
    }
}

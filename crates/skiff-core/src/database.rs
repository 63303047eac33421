use std::time::Duration;

use skiff_types::error::Result;
use skiff_types::remote_volume::VolumeState;

/// The operations the transfer core performs against the local database.
///
/// The database engine itself lives elsewhere; the core only records what
/// happened remotely. All mutation between `begin_transaction` and
/// `commit` must be atomic.
pub trait VolumeDatabase: Send {
    fn begin_transaction(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;

    /// Append one line to the remote-operation audit log.
    fn log_remote_operation(&mut self, action: &str, file: &str, result: &str) -> Result<()>;

    /// Record the state of a remote volume.
    fn update_remote_volume(
        &mut self,
        name: &str,
        state: VolumeState,
        size: i64,
        hash: Option<&str>,
    ) -> Result<()>;

    /// Like [`update_remote_volume`](Self::update_remote_volume), but the
    /// record is kept for `grace` before becoming eligible for cleanup.
    /// Used for deletes against backends with delayed consistency.
    fn update_remote_volume_with_grace(
        &mut self,
        name: &str,
        state: VolumeState,
        size: i64,
        hash: Option<&str>,
        grace: Duration,
    ) -> Result<()>;

    /// Point all records for `old` at the new remote filename.
    fn rename_remote_volume(&mut self, old: &str, new: &str) -> Result<()>;

    /// Drop volume records entirely once their remote copies are gone.
    fn remove_remote_volumes(&mut self, names: &[String]) -> Result<()>;
}

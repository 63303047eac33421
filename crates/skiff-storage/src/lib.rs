pub mod local_backend;

use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};

use skiff_types::error::{Result, SkiffError};
use skiff_types::remote_volume::{FileEntry, QuotaInfo};

pub use local_backend::LocalBackend;

/// A connection to one remote storage destination.
///
/// Implementations transfer whole files by path; backends that can do
/// better expose the optional capability traits below. One instance is
/// used by at most one operation at a time; instances are pooled and
/// reused by the caller.
pub trait Backend: Send {
    /// Short human-readable name for logs ("file", "s3", ...).
    fn display_name(&self) -> &str;

    /// Enumerate all entries at the destination.
    fn list(&self) -> Result<Vec<FileEntry>>;

    /// Upload the local file to `remotename`.
    fn put(&self, remotename: &str, local: &Path) -> Result<()>;

    /// Download `remotename` into the local file path.
    fn get(&self, remotename: &str, local: &Path) -> Result<()>;

    /// Delete `remotename`. Must report a missing file as
    /// [`SkiffError::FileMissing`] rather than succeeding silently, so the
    /// caller can reconcile deletes that already happened.
    fn delete(&self, remotename: &str) -> Result<()>;

    /// Create the destination folder/bucket/container.
    fn create_folder(&self) -> Result<()>;

    /// Host names this backend connects to, for DNS cache refresh.
    fn dns_names(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn as_streaming(&self) -> Option<&dyn StreamingBackend> {
        None
    }

    fn as_quota(&self) -> Option<&dyn QuotaBackend> {
        None
    }

    fn as_locking(&self) -> Option<&dyn LockingBackend> {
        None
    }
}

/// Stream-based transfer. Throttling and progress reporting are layered
/// onto the streams by the caller, not the backend.
pub trait StreamingBackend {
    fn put_stream(&self, remotename: &str, source: &mut dyn Read) -> Result<()>;
    fn get_stream(&self, remotename: &str, target: &mut dyn Write) -> Result<()>;
}

/// Capacity reporting.
pub trait QuotaBackend {
    fn quota_info(&self) -> Result<QuotaInfo>;
}

/// Object-lock (retention) support.
pub trait LockingBackend {
    fn object_lock_until(&self, remotename: &str) -> Result<Option<DateTime<Utc>>>;
    fn set_object_lock_until(&self, remotename: &str, until: DateTime<Utc>) -> Result<()>;
}

/// Build a backend from a destination URL.
///
/// `file://<path>` and plain paths map to [`LocalBackend`]. Remote
/// protocol backends are provided by plugins and registered by the
/// application, not by this crate.
pub fn backend_from_url(url: &str) -> Result<Box<dyn Backend>> {
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(Box::new(LocalBackend::new(path)?));
    }
    match url.split_once("://") {
        Some((scheme, _)) => Err(SkiffError::Unsupported(format!(
            "backend scheme '{scheme}' is not available"
        ))),
        None => Ok(Box::new(LocalBackend::new(url)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_rejects_unknown_scheme() {
        let err = match backend_from_url("carrier-pigeon://coop") {
            Err(e) => e,
            Ok(_) => panic!("expected unknown scheme to be rejected"),
        };
        assert!(matches!(err, SkiffError::Unsupported(_)));
    }

    #[test]
    fn factory_builds_local_from_plain_path() {
        let dir = std::env::temp_dir();
        let backend = backend_from_url(dir.to_str().unwrap()).unwrap();
        assert_eq!(backend.display_name(), "file");
    }
}

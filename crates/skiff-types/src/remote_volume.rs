use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a volume on the remote destination.
///
/// States only move forward; a failed upload replaces the remote *name*
/// (see [`crate::volume_name::fresh_rename`]) rather than regressing the
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VolumeState {
    /// Created locally, nothing sent yet.
    Temporary,
    /// An upload attempt has started.
    Uploading,
    /// The upload finished.
    Uploaded,
    /// The remote copy has been verified against hash and size.
    Verified,
    /// A delete has been requested but not yet confirmed.
    Deleting,
    /// The remote copy is gone.
    Deleted,
}

impl VolumeState {
    pub fn can_advance_to(self, next: VolumeState) -> bool {
        next >= self
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VolumeState::Temporary => "Temporary",
            VolumeState::Uploading => "Uploading",
            VolumeState::Uploaded => "Uploaded",
            VolumeState::Verified => "Verified",
            VolumeState::Deleting => "Deleting",
            VolumeState::Deleted => "Deleted",
        }
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A volume as known to the local database: remote name plus the expected
/// hash and size (either may be unknown).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteVolume {
    pub name: String,
    /// Base64 digest, `None` if not yet computed.
    pub hash: Option<String>,
    /// Size in bytes, -1 if unknown.
    pub size: i64,
}

impl RemoteVolume {
    pub fn new(name: impl Into<String>, hash: Option<String>, size: i64) -> Self {
        Self {
            name: name.into(),
            hash,
            size,
        }
    }
}

/// One entry in a backend listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    /// Size in bytes, -1 if the backend does not report sizes.
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
    pub is_folder: bool,
}

impl FileEntry {
    pub fn file(name: impl Into<String>, size: i64) -> Self {
        Self {
            name: name.into(),
            size,
            last_modified: None,
            is_folder: false,
        }
    }
}

/// Capacity report from a quota-aware backend. -1 means unknown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaInfo {
    pub total_bytes: i64,
    pub free_bytes: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered_forward() {
        assert!(VolumeState::Uploading.can_advance_to(VolumeState::Uploaded));
        assert!(VolumeState::Uploaded.can_advance_to(VolumeState::Uploaded));
        assert!(!VolumeState::Uploaded.can_advance_to(VolumeState::Uploading));
        assert!(VolumeState::Verified.can_advance_to(VolumeState::Deleted));
    }
}

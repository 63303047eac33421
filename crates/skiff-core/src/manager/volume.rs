use std::io::Write;

use serde::{Deserialize, Serialize};
use tempfile::TempPath;

use skiff_types::error::{Result, SkiffError};

/// A finished volume ready for upload: its remote name and the local
/// temp file holding its content. The temp file is owned by the upload
/// from here on and removed on every exit path.
pub struct VolumeUpload {
    pub remote_name: String,
    pub local_file: TempPath,
}

impl VolumeUpload {
    pub fn new(remote_name: impl Into<String>, local_file: TempPath) -> Self {
        Self {
            remote_name: remote_name.into(),
            local_file,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexBlockEntry {
    name: String,
    hash: Option<String>,
    size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexDocument {
    volumes: Vec<IndexBlockEntry>,
}

/// Writer for an index volume: a small companion volume describing the
/// block volumes it references.
///
/// The content cannot be finalized until the referenced block volume's
/// hash and size are known, which only happens after encryption. If the
/// block volume is renamed between upload attempts, every reference is
/// rewritten to the new name and the serialized form is regenerated into
/// a fresh temp file.
pub struct IndexVolumeWriter {
    pub remote_name: String,
    document: IndexDocument,
    finished: bool,
}

impl IndexVolumeWriter {
    pub fn new(remote_name: impl Into<String>) -> Self {
        Self {
            remote_name: remote_name.into(),
            document: IndexDocument {
                volumes: Vec::new(),
            },
            finished: false,
        }
    }

    /// Reference a block volume. Hash and size stay unknown until
    /// [`finish`](Self::finish).
    pub fn add_block_volume(&mut self, name: &str) {
        self.document.volumes.push(IndexBlockEntry {
            name: name.to_string(),
            hash: None,
            size: -1,
        });
    }

    pub fn references(&self, name: &str) -> bool {
        self.document.volumes.iter().any(|v| v.name == name)
    }

    /// Fix the referenced block volume's hash/size and serialize the
    /// final content into a temp file.
    pub(crate) fn finish(
        &mut self,
        block_name: &str,
        hash: Option<&str>,
        size: i64,
    ) -> Result<TempPath> {
        if self.finished {
            return Err(SkiffError::Other(
                "index volume already finished".into(),
            ));
        }
        for entry in &mut self.document.volumes {
            if entry.name == block_name {
                entry.hash = hash.map(str::to_string);
                entry.size = size;
            }
        }
        self.finished = true;
        self.serialize()
    }

    /// Replace every reference to `old` with `new` and write the updated
    /// content into a fresh temp file. The caller swaps it in for the old
    /// one.
    pub(crate) fn rewrite_renamed(&mut self, old: &str, new: &str) -> Result<TempPath> {
        for entry in &mut self.document.volumes {
            if entry.name == old {
                entry.name = new.to_string();
            }
        }
        self.serialize()
    }

    fn serialize(&self) -> Result<TempPath> {
        let mut file = tempfile::NamedTempFile::new()?;
        serde_json::to_writer(&mut file, &self.document)
            .map_err(|e| SkiffError::Other(format!("index volume serialization: {e}")))?;
        file.flush()?;
        Ok(file.into_temp_path())
    }
}

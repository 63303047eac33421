use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};

use skiff_types::error::{Result, SkiffError};
use skiff_types::remote_volume::FileEntry;

use crate::{Backend, StreamingBackend};

/// Storage backend for a local directory using `std::fs` directly.
///
/// Useful on its own for disk/NAS targets and as the reference
/// implementation the test suite runs against.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at the given directory path. The directory
    /// does not have to exist yet; `create_folder` brings it into being.
    pub fn new(root: &str) -> Result<Self> {
        let root_path = PathBuf::from(root);
        // Canonicalize if the path already exists for clearer errors and
        // correct behavior with symlinked roots.
        let root = if root_path.exists() {
            fs::canonicalize(&root_path)?
        } else {
            root_path
        };
        Ok(Self { root })
    }

    /// Reject remote names that could escape the destination root.
    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(SkiffError::Other("unsafe remote name: empty".into()));
        }
        if name.starts_with('/') || name.starts_with('\\') || name.contains('\\') {
            return Err(SkiffError::Other(format!(
                "unsafe remote name: '{name}'"
            )));
        }
        for component in Path::new(name).components() {
            if component == Component::ParentDir {
                return Err(SkiffError::Other(format!(
                    "unsafe remote name: parent traversal '{name}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        Self::validate_name(name)?;
        Ok(self.root.join(name))
    }

    fn open_existing(&self, name: &str) -> Result<fs::File> {
        let path = self.resolve(name)?;
        match fs::File::open(&path) {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(SkiffError::FileMissing(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn missing_root(&self) -> SkiffError {
        SkiffError::FolderMissing(self.root.display().to_string())
    }
}

impl Backend for LocalBackend {
    fn display_name(&self) -> &str {
        "file"
    }

    fn list(&self) -> Result<Vec<FileEntry>> {
        let rd = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(self.missing_root()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for entry in rd {
            let entry = entry?;
            let meta = entry.metadata()?;
            let modified = meta
                .modified()
                .ok()
                .map(DateTime::<Utc>::from);
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: if meta.is_file() { meta.len() as i64 } else { -1 },
                last_modified: modified,
                is_folder: meta.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn put(&self, remotename: &str, local: &Path) -> Result<()> {
        let mut source = fs::File::open(local)?;
        self.put_stream(remotename, &mut source)
    }

    fn get(&self, remotename: &str, local: &Path) -> Result<()> {
        let mut source = self.open_existing(remotename)?;
        let mut target = fs::File::create(local)?;
        io::copy(&mut source, &mut target)?;
        target.flush()?;
        Ok(())
    }

    fn delete(&self, remotename: &str) -> Result<()> {
        let path = self.resolve(remotename)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(SkiffError::FileMissing(remotename.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create_folder(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    fn as_streaming(&self) -> Option<&dyn StreamingBackend> {
        Some(self)
    }
}

impl StreamingBackend for LocalBackend {
    fn put_stream(&self, remotename: &str, source: &mut dyn Read) -> Result<()> {
        let path = self.resolve(remotename)?;
        if !self.root.exists() {
            return Err(self.missing_root());
        }
        // Write to a temp file in the same directory, then atomically
        // rename into place so readers never see a partial file.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        io::copy(source, &mut tmp)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn get_stream(&self, remotename: &str, target: &mut dyn Write) -> Result<()> {
        let mut source = self.open_existing(remotename)?;
        io::copy(&mut source, target)?;
        target.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().to_str().unwrap()).unwrap();
        (dir, backend)
    }

    #[test]
    fn put_get_delete_cycle() {
        let (dir, backend) = backend();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"volume bytes").unwrap();

        backend.put("vol-a.zip", &src).unwrap();
        let names: Vec<_> = backend.list().unwrap().into_iter().map(|e| e.name).collect();
        assert!(names.contains(&"vol-a.zip".to_string()));

        let dst = dir.path().join("dst.bin");
        backend.get("vol-a.zip", &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"volume bytes");

        backend.delete("vol-a.zip").unwrap();
        let err = backend.delete("vol-a.zip").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn get_missing_is_typed() {
        let (_dir, backend) = backend();
        let err = backend
            .get("nope.zip", &std::env::temp_dir().join("skiff-nope"))
            .unwrap_err();
        assert!(matches!(err, SkiffError::FileMissing(_)));
    }

    #[test]
    fn unsafe_names_rejected() {
        let (_dir, backend) = backend();
        for name in ["", "/abs", "a\\b", "../escape"] {
            assert!(backend.resolve(name).is_err(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn put_into_missing_root_reports_folder_missing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("not-created");
        let backend = LocalBackend::new(root.to_str().unwrap()).unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"x").unwrap();
        let err = backend.put("vol.zip", &src).unwrap_err();
        assert!(err.is_folder_missing());

        backend.create_folder().unwrap();
        backend.put("vol.zip", &src).unwrap();
    }
}

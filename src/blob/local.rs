//! # Local Filesystem Backend
//!
//! One file per blob, named by digest. Writes go to a unique temporary
//! file that is fsynced and renamed into place, so readers never observe a
//! partial blob and concurrent writers of the same content converge.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use uuid::Uuid;

use super::backend::BlobBackend;
use super::errors::{BlobError, BlobResult};

const TEMP_SUFFIX: &str = ".tmp";

/// Local filesystem blob backend
#[derive(Debug)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at `root`, creating the directory
    pub fn new(root: PathBuf) -> BlobResult<Self> {
        fs::create_dir_all(&root).map_err(|e| BlobError::IoError(e.to_string()))?;
        Ok(Self { root })
    }

    fn full_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn map_missing(name: &str, e: std::io::Error) -> BlobError {
        if e.kind() == ErrorKind::NotFound {
            BlobError::NotFound(name.to_string())
        } else {
            BlobError::IoError(e.to_string())
        }
    }
}

impl BlobBackend for LocalBackend {
    fn write_if_absent(&self, name: &str, data: &[u8]) -> BlobResult<bool> {
        let full_path = self.full_path(name);
        if full_path.exists() {
            return Ok(false);
        }

        let temp_path = self
            .root
            .join(format!("{}.{}{}", name, Uuid::new_v4(), TEMP_SUFFIX));
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            fs::rename(&temp_path, &full_path)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&temp_path);
            return Err(BlobError::IoError(e.to_string()));
        }
        Ok(true)
    }

    fn read(&self, name: &str) -> BlobResult<Vec<u8>> {
        fs::read(self.full_path(name)).map_err(|e| Self::map_missing(name, e))
    }

    fn delete(&self, name: &str) -> BlobResult<()> {
        fs::remove_file(self.full_path(name)).map_err(|e| Self::map_missing(name, e))
    }

    fn exists(&self, name: &str) -> BlobResult<bool> {
        Ok(self.full_path(name).is_file())
    }

    fn list(&self) -> BlobResult<Vec<String>> {
        let mut results = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| BlobError::IoError(e.to_string()))? {
            let entry = entry.map_err(|e| BlobError::IoError(e.to_string()))?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(TEMP_SUFFIX) {
                    results.push(name.to_string());
                }
            }
        }
        results.sort();
        Ok(results)
    }

    fn size(&self, name: &str) -> BlobResult<u64> {
        fs::metadata(self.full_path(name))
            .map(|m| m.len())
            .map_err(|e| Self::map_missing(name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path().join("blobs")).unwrap();

        assert!(backend.write_if_absent("a", b"hello").unwrap());
        assert_eq!(backend.read("a").unwrap(), b"hello");
        assert_eq!(backend.size("a").unwrap(), 5);
    }

    #[test]
    fn test_second_write_is_skipped() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path().to_path_buf()).unwrap();

        assert!(backend.write_if_absent("a", b"first").unwrap());
        assert!(!backend.write_if_absent("a", b"first").unwrap());
        assert_eq!(backend.list().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_delete() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path().to_path_buf()).unwrap();

        backend.write_if_absent("gone", b"bye").unwrap();
        backend.delete("gone").unwrap();
        assert!(!backend.exists("gone").unwrap());
        assert!(matches!(backend.delete("gone"), Err(BlobError::NotFound(_))));
    }

    #[test]
    fn test_not_found() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path().to_path_buf()).unwrap();

        assert!(matches!(backend.read("missing"), Err(BlobError::NotFound(_))));
    }
}

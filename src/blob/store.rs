//! Content-addressed blob store
//!
//! Blobs are keyed by the digest of their content, so storing the same
//! bytes twice yields the same digest and a single file. Loaded content is
//! re-hashed; a mismatch is corruption.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use super::backend::BlobBackend;
use super::blob_ref::{digest_of, is_valid_digest, BlobRef};
use super::errors::{BlobError, BlobResult};
use super::local::LocalBackend;

#[derive(Debug, Clone)]
pub struct BlobStore {
    backend: Arc<dyn BlobBackend>,
    /// Digests written since the last garbage collection
    recent: Arc<Mutex<BTreeSet<String>>>,
}

impl BlobStore {
    pub fn new(backend: Arc<dyn BlobBackend>) -> Self {
        Self {
            backend,
            recent: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Store on the local filesystem under `root`
    pub fn open_local(root: PathBuf) -> BlobResult<Self> {
        Ok(Self::new(Arc::new(LocalBackend::new(root)?)))
    }

    /// Stores content and returns its reference
    pub fn store(&self, content: &[u8], content_type: Option<&str>) -> BlobResult<BlobRef> {
        let blob = BlobRef::for_content(content, content_type);
        self.backend.write_if_absent(&blob.digest, content)?;
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(blob.digest.clone());
        Ok(blob)
    }

    /// Stores content that must hash to `digest`
    pub fn store_expecting(&self, digest: &str, content: &[u8]) -> BlobResult<()> {
        let actual = digest_of(content);
        if actual != digest {
            return Err(BlobError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }
        self.store(content, None).map(|_| ())
    }

    /// Loads and verifies content
    pub fn load(&self, digest: &str) -> BlobResult<Vec<u8>> {
        if !is_valid_digest(digest) {
            return Err(BlobError::InvalidDigest(digest.to_string()));
        }
        let content = self.backend.read(digest)?;
        let actual = digest_of(&content);
        if actual != digest {
            return Err(BlobError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }
        Ok(content)
    }

    pub fn contains(&self, digest: &str) -> BlobResult<bool> {
        if !is_valid_digest(digest) {
            return Ok(false);
        }
        self.backend.exists(digest)
    }

    pub fn delete(&self, digest: &str) -> BlobResult<()> {
        if !is_valid_digest(digest) {
            return Err(BlobError::InvalidDigest(digest.to_string()));
        }
        self.backend.delete(digest)
    }

    /// All stored digests
    pub fn digests(&self) -> BlobResult<Vec<String>> {
        Ok(self
            .backend
            .list()?
            .into_iter()
            .filter(|name| is_valid_digest(name))
            .collect())
    }

    /// Total bytes of stored content
    pub fn total_size(&self) -> BlobResult<u64> {
        self.digests()?
            .iter()
            .map(|d| self.backend.size(d))
            .sum()
    }

    /// Deletes stored blobs not in `referenced`
    ///
    /// Blobs written since the previous collection are spared once, since a
    /// document referencing them may not have been committed yet.
    pub fn collect_garbage(&self, referenced: &BTreeSet<String>) -> BlobResult<usize> {
        let spared = std::mem::take(&mut *self.recent.lock().unwrap_or_else(PoisonError::into_inner));
        let mut deleted = 0;
        for digest in self.digests()? {
            if referenced.contains(&digest) || spared.contains(&digest) {
                continue;
            }
            match self.backend.delete(&digest) {
                Ok(()) => deleted += 1,
                Err(BlobError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, BlobStore) {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::open_local(temp.path().join("blobs")).unwrap();
        (temp, store)
    }

    #[test]
    fn test_store_dedups() {
        let (_temp, store) = store();
        let a = store.store(b"same bytes", Some("text/plain")).unwrap();
        let size = store.total_size().unwrap();
        let b = store.store(b"same bytes", None).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(store.total_size().unwrap(), size);
        assert_eq!(store.digests().unwrap().len(), 1);
    }

    #[test]
    fn test_load_round_trip() {
        let (_temp, store) = store();
        let blob = store.store(b"payload", None).unwrap();
        assert_eq!(store.load(&blob.digest).unwrap(), b"payload");
        assert_eq!(blob.length, 7);
    }

    #[test]
    fn test_load_missing() {
        let (_temp, store) = store();
        let digest = digest_of(b"never stored");
        assert!(matches!(store.load(&digest), Err(BlobError::NotFound(_))));
        assert!(matches!(store.load("bogus"), Err(BlobError::InvalidDigest(_))));
    }

    #[test]
    fn test_load_detects_tampering() {
        let (temp, store) = store();
        let blob = store.store(b"original", None).unwrap();
        std::fs::write(temp.path().join("blobs").join(&blob.digest), b"tampered").unwrap();
        let err = store.load(&blob.digest).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_store_expecting_rejects_mismatch() {
        let (_temp, store) = store();
        let digest = digest_of(b"one");
        assert!(store.store_expecting(&digest, b"two").is_err());
        store.store_expecting(&digest, b"one").unwrap();
        assert!(store.contains(&digest).unwrap());
    }

    #[test]
    fn test_garbage_collection_spares_recent_once() {
        let (_temp, store) = store();
        let keep = store.store(b"keep", None).unwrap();
        let drop = store.store(b"drop", None).unwrap();
        let referenced: BTreeSet<String> = [keep.digest.clone()].into_iter().collect();

        assert_eq!(store.collect_garbage(&referenced).unwrap(), 0);
        assert_eq!(store.collect_garbage(&referenced).unwrap(), 1);
        assert!(store.contains(&keep.digest).unwrap());
        assert!(!store.contains(&drop.digest).unwrap());
    }
}

//! # Blob Backend Trait

use super::errors::BlobResult;

/// Backend holding immutable blob files keyed by digest
pub trait BlobBackend: Send + Sync + std::fmt::Debug {
    /// Write `data` under `name` unless it already exists
    ///
    /// Returns `true` if the blob was written, `false` if it was present.
    fn write_if_absent(&self, name: &str, data: &[u8]) -> BlobResult<bool>;

    /// Read the blob stored under `name`
    fn read(&self, name: &str) -> BlobResult<Vec<u8>>;

    /// Delete the blob stored under `name`
    fn delete(&self, name: &str) -> BlobResult<()>;

    /// Check if `name` exists
    fn exists(&self, name: &str) -> BlobResult<bool>;

    /// Names of all stored blobs
    fn list(&self) -> BlobResult<Vec<String>>;

    /// Size in bytes of the blob stored under `name`
    fn size(&self, name: &str) -> BlobResult<u64>;
}

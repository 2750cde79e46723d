//! # Blob Store
//!
//! Content-addressed storage for attachments. Documents reference blobs by
//! digest through `BlobRef`; content lives under `<db>/blobs/<digest>`.
//!
//! ## Features
//!
//! - SHA-256 digests (`sha256-<base64url>`)
//! - Automatic deduplication
//! - Atomic temp-file + rename writes
//! - Verification on every load
//! - Garbage collection of unreferenced blobs during compaction

mod backend;
mod blob_ref;
mod errors;
mod local;
mod store;

pub use backend::BlobBackend;
pub use blob_ref::{digest_of, is_valid_digest, BlobRef};
pub use errors::{BlobError, BlobResult};
pub use local::LocalBackend;
pub use store::BlobStore;

//! Storage abstraction for durable document persistence.
//!
//! [`DebouncedDisk`](crate::disk::DebouncedDisk) writes through one of these
//! backends. Implementations only need plain keyed load/save; coalescing,
//! retry, and pending-write tracking live in the disk layer.

use crate::error::CollabError;
use crate::types::{StoredDoc, Version};

/// Result type for storage operations
pub type StorageResult<T> = Result<T, CollabError>;

/// Backend persistence for collaborative documents.
///
/// Implementations must be safe to call from multiple threads; calls for the
/// same key are already serialized by the disk layer.
pub trait DiskStorage: Send + Sync {
    /// Load a stored document. Returns `None` when the key is absent.
    fn load_doc(&self, key: &str) -> StorageResult<Option<StoredDoc>>;

    /// Persist `content` for `key`. `version` is the document version in
    /// effect when the write was scheduled, so a backend can detect stale
    /// writes if it keeps its own bookkeeping.
    fn save_doc(&self, key: &str, content: &str, version: Version) -> StorageResult<()>;

    /// Remove a stored document. Removing an absent key is not an error.
    fn delete_doc(&self, key: &str) -> StorageResult<()>;

    /// List all stored document keys.
    fn list_docs(&self) -> StorageResult<Vec<String>>;

    /// Whether a document exists without loading its content.
    fn has_doc(&self, key: &str) -> StorageResult<bool> {
        Ok(self.load_doc(key)?.is_some())
    }
}

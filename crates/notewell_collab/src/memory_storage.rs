//! In-memory storage implementation for testing.
//!
//! This provides a simple in-memory implementation of [`DiskStorage`]
//! for use in unit tests and development.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::storage::{DiskStorage, StorageResult};
use crate::types::{StoredDoc, Version};

/// In-memory document storage for testing.
///
/// Stores documents in a `HashMap` behind an `RwLock`; data is lost when
/// dropped. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    docs: Arc<RwLock<HashMap<String, StoredDoc>>>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.docs.read().unwrap().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.docs.read().unwrap().is_empty()
    }
}

impl DiskStorage for MemoryStorage {
    fn load_doc(&self, key: &str) -> StorageResult<Option<StoredDoc>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(key).cloned())
    }

    fn save_doc(&self, key: &str, content: &str, version: Version) -> StorageResult<()> {
        let mut docs = self.docs.write().unwrap();
        docs.insert(key.to_string(), StoredDoc::new(content, version));
        Ok(())
    }

    fn delete_doc(&self, key: &str) -> StorageResult<()> {
        let mut docs = self.docs.write().unwrap();
        docs.remove(key);
        Ok(())
    }

    fn list_docs(&self) -> StorageResult<Vec<String>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.keys().cloned().collect())
    }
}

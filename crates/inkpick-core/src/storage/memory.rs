//! In-memory storage implementation.

use super::{Lease, Storage, StorageError, StorageHandle, StorageResult};
use std::collections::HashMap;
use std::sync::{MutexGuard, PoisonError, RwLock};

/// In-memory storage for testing and ephemeral use.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
    lease: Lease,
}

impl MemoryStorage {
    /// Create a new empty memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the storage is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storage for MemoryStorage {
    fn acquire(&self) -> StorageResult<Box<dyn StorageHandle + '_>> {
        let guard = self.lease.try_acquire("memory storage")?;
        Ok(Box::new(MemoryHandle {
            storage: self,
            _lease: guard,
        }))
    }

    fn is_leased(&self) -> bool {
        self.lease.is_held()
    }
}

struct MemoryHandle<'a> {
    storage: &'a MemoryStorage,
    _lease: MutexGuard<'a, ()>,
}

impl StorageHandle for MemoryHandle<'_> {
    fn read(&self, key: &str) -> StorageResult<String> {
        let entries = self.storage.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn write(&mut self, key: &str, contents: &str) -> StorageResult<()> {
        let mut entries = self.storage.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), contents.to_string());
        Ok(())
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        let entries = self.storage.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read() {
        let storage = MemoryStorage::new();
        let mut handle = storage.acquire().unwrap();

        handle.write("test", "payload").unwrap();
        assert_eq!(handle.read("test").unwrap(), "payload");
        drop(handle);
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_not_found() {
        let storage = MemoryStorage::new();
        let handle = storage.acquire().unwrap();

        assert!(matches!(handle.read("nonexistent"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_exists() {
        let storage = MemoryStorage::new();
        let mut handle = storage.acquire().unwrap();

        assert!(!handle.exists("test").unwrap());
        handle.write("test", "").unwrap();
        assert!(handle.exists("test").unwrap());
    }

    #[test]
    fn test_busy_while_leased() {
        let storage = MemoryStorage::new();
        let first = storage.acquire().unwrap();
        assert!(matches!(storage.acquire(), Err(StorageError::Busy(_))));
        drop(first);
        assert!(!storage.is_leased());
    }
}

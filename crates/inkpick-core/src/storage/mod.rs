//! Scoped storage handles used by history export and import.
//!
//! A [`Storage`] hands out at most one [`StorageHandle`] at a time. The
//! handle holds the storage lease for as long as it lives, so dropping it on
//! any exit path (success, `?`, panic unwind) releases the storage.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use std::sync::{Mutex, MutexGuard, TryLockError};
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Entry not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Storage is busy: {0}")]
    Busy(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// A keyed text store that can be leased by one caller at a time.
pub trait Storage: Send + Sync {
    /// Take the lease and return a handle. Fails with
    /// [`StorageError::Busy`] while another handle is alive.
    fn acquire(&self) -> StorageResult<Box<dyn StorageHandle + '_>>;

    /// Whether a handle is currently alive.
    fn is_leased(&self) -> bool;
}

/// Access to a leased storage. Dropping the handle releases the lease.
pub trait StorageHandle {
    /// Read the entry stored under `key`.
    fn read(&self, key: &str) -> StorageResult<String>;

    /// Replace the entry stored under `key`.
    fn write(&mut self, key: &str, contents: &str) -> StorageResult<()>;

    /// Whether an entry exists under `key`.
    fn exists(&self, key: &str) -> StorageResult<bool>;
}

/// Exclusive lease shared by the storage backends.
#[derive(Debug, Default)]
pub(crate) struct Lease(Mutex<()>);

impl Lease {
    pub(crate) fn try_acquire(&self, what: &str) -> StorageResult<MutexGuard<'_, ()>> {
        match self.0.try_lock() {
            Ok(guard) => Ok(guard),
            // A holder panicked; the lease itself is still free.
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(StorageError::Busy(what.to_string())),
        }
    }

    pub(crate) fn is_held(&self) -> bool {
        matches!(self.0.try_lock(), Err(TryLockError::WouldBlock))
    }
}

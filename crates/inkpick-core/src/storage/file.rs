//! File-based storage.

use super::{Lease, Storage, StorageError, StorageHandle, StorageResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::MutexGuard;

/// Stores each entry as a file in a base directory. Keys are file names.
#[derive(Debug)]
pub struct FileStorage {
    /// Base directory for entries.
    base_path: PathBuf,
    /// Use plain file-name keys as given instead of sanitizing them.
    verbatim_keys: bool,
    lease: Lease,
}

impl FileStorage {
    /// Create a new file storage with the given base directory.
    ///
    /// Creates the directory if it doesn't exist.
    pub fn new(base_path: PathBuf) -> StorageResult<Self> {
        let storage = Self {
            base_path,
            verbatim_keys: false,
            lease: Lease::default(),
        };
        storage.create_dir()?;
        Ok(storage)
    }

    /// Storage rooted at the parent of `path`, plus the key naming `path`.
    ///
    /// The file name is kept exactly as given and no directory is created.
    pub fn for_path(path: &Path) -> StorageResult<(Self, String)> {
        let key = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| StorageError::Io(format!("Not a file path: {}", path.display())))?
            .to_string();
        let base_path = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let storage = Self {
            base_path,
            verbatim_keys: true,
            lease: Lease::default(),
        };
        Ok((storage, key))
    }

    /// Get the base path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Create the base directory if it doesn't exist.
    pub fn create_dir(&self) -> StorageResult<()> {
        if !self.base_path.exists() {
            fs::create_dir_all(&self.base_path).map_err(|e| {
                StorageError::Io(format!("Failed to create storage directory: {}", e))
            })?;
        }
        Ok(())
    }

    /// File path for a key. Separators and other unsafe characters become `_`,
    /// except that storages opened with [`FileStorage::for_path`] keep plain
    /// file names untouched.
    fn entry_path(&self, key: &str) -> PathBuf {
        let plain = Path::new(key).file_name().and_then(|name| name.to_str()) == Some(key);
        if self.verbatim_keys && plain {
            return self.base_path.join(key);
        }
        let safe: String = key
            .chars()
            .enumerate()
            .map(|(i, c)| {
                let allowed = c.is_alphanumeric() || c == '-' || c == '_' || (c == '.' && i > 0);
                if allowed { c } else { '_' }
            })
            .collect();
        self.base_path.join(safe)
    }
}

impl Storage for FileStorage {
    fn acquire(&self) -> StorageResult<Box<dyn StorageHandle + '_>> {
        let guard = self.lease.try_acquire(&self.base_path.display().to_string())?;
        Ok(Box::new(FileHandle {
            storage: self,
            _lease: guard,
        }))
    }

    fn is_leased(&self) -> bool {
        self.lease.is_held()
    }
}

struct FileHandle<'a> {
    storage: &'a FileStorage,
    _lease: MutexGuard<'a, ()>,
}

impl StorageHandle for FileHandle<'_> {
    fn read(&self, key: &str) -> StorageResult<String> {
        let path = self.storage.entry_path(key);
        if !path.exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        fs::read_to_string(&path)
            .map_err(|e| StorageError::Io(format!("Failed to read {}: {}", path.display(), e)))
    }

    fn write(&mut self, key: &str, contents: &str) -> StorageResult<()> {
        let path = self.storage.entry_path(key);
        let tmp = path.with_extension("tmp");

        let result = fs::write(&tmp, contents)
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|e| StorageError::Io(format!("Failed to write {}: {}", path.display(), e)));
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.storage.entry_path(key).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_storage_write_read() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        let mut handle = storage.acquire().unwrap();
        handle.write("history.json", "{\"a\":1}").unwrap();
        assert_eq!(handle.read("history.json").unwrap(), "{\"a\":1}");
        assert!(!dir.path().join("history.tmp").exists());
    }

    #[test]
    fn test_file_storage_not_found() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        let handle = storage.acquire().unwrap();
        assert!(matches!(handle.read("missing.json"), Err(StorageError::NotFound(_))));
        assert!(!handle.exists("missing.json").unwrap());
    }

    #[test]
    fn test_file_storage_sanitizes_key() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        let mut handle = storage.acquire().unwrap();
        handle.write("../escape/doc:with*special", "x").unwrap();
        assert_eq!(handle.read("../escape/doc:with*special").unwrap(), "x");
        assert!(!dir.path().parent().unwrap().join("escape").exists());
    }

    #[test]
    fn test_lease_is_exclusive_and_released_on_drop() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        let handle = storage.acquire().unwrap();
        assert!(storage.is_leased());
        assert!(matches!(storage.acquire(), Err(StorageError::Busy(_))));
        drop(handle);
        assert!(!storage.is_leased());
        assert!(storage.acquire().is_ok());
    }

    #[test]
    fn test_failed_write_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("gone");
        let storage = FileStorage::new(base.clone()).unwrap();
        fs::remove_dir_all(&base).unwrap();

        {
            let mut handle = storage.acquire().unwrap();
            assert!(matches!(handle.write("h.json", "x"), Err(StorageError::Io(_))));
        }
        assert!(!storage.is_leased());
        assert!(!base.join("h.tmp").exists());
    }

    #[test]
    fn test_for_path_splits_parent_and_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("history.json");
        let (storage, key) = FileStorage::for_path(&path).unwrap();
        assert_eq!(key, "history.json");
        assert_eq!(storage.base_path(), dir.path().join("nested"));
        assert!(!dir.path().join("nested").exists());
    }

    #[test]
    fn test_for_path_keeps_exact_file_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("my history (1).json");
        let (storage, key) = FileStorage::for_path(&path).unwrap();

        let mut handle = storage.acquire().unwrap();
        handle.write(&key, "x").unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("my_history__1_.json").exists());
        assert_eq!(handle.read(&key).unwrap(), "x");
    }

    #[test]
    fn test_for_path_read_does_not_create_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent").join("history.json");
        let (storage, key) = FileStorage::for_path(&path).unwrap();

        let handle = storage.acquire().unwrap();
        assert!(matches!(handle.read(&key), Err(StorageError::NotFound(_))));
        assert!(!dir.path().join("absent").exists());
    }
}

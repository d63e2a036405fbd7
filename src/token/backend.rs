//! Key-Value Backends
//!
//! String key-value stores underneath the durable token tiers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::StorageError;

const ENOSPC: i32 = 28;

/// Key-value store interface.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Backend name used in errors and logs.
    fn name(&self) -> &str;

    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value.
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a value. Removing an absent key succeeds.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// One file per key inside a directory.
pub struct FileKeyValueStore {
    name: String,
    dir: PathBuf,
}

impl FileKeyValueStore {
    /// Create new file store rooted at `dir`. The directory is created on first write.
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", file))
    }

    fn map_io(&self, error: io::Error, path: &Path, write: bool) -> StorageError {
        if error.kind() == io::ErrorKind::PermissionDenied {
            return StorageError::PermissionDenied {
                path: path.display().to_string(),
            };
        }
        if error.raw_os_error() == Some(ENOSPC) {
            return StorageError::QuotaExceeded {
                tier: self.name.clone(),
            };
        }
        let message = format!("{}: {}", path.display(), error);
        if write {
            StorageError::WriteFailed {
                tier: self.name.clone(),
                message,
            }
        } else {
            StorageError::ReadFailed {
                tier: self.name.clone(),
                message,
            }
        }
    }

    #[cfg(unix)]
    async fn restrict_permissions(path: &Path) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
    }

    #[cfg(not(unix))]
    async fn restrict_permissions(_path: &Path) -> io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.map_io(e, &path, false)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| self.map_io(e, &self.dir, true))?;

        let path = self.path_for(key);
        let temp = path.with_extension("json.tmp");

        tokio::fs::write(&temp, value)
            .await
            .map_err(|e| self.map_io(e, &temp, true))?;
        Self::restrict_permissions(&temp)
            .await
            .map_err(|e| self.map_io(e, &temp, true))?;
        tokio::fs::rename(&temp, &path)
            .await
            .map_err(|e| self.map_io(e, &path, true))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::DeleteFailed {
                tier: self.name.clone(),
                message: format!("{}: {}", path.display(), e),
            }),
        }
    }
}

/// Process-local store.
pub struct MemoryKeyValueStore {
    name: String,
    values: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    /// Create new in-memory store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Mock store for testing, with failure injection and call history.
pub struct MockKeyValueStore {
    inner: MemoryKeyValueStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_key: Mutex<Option<String>>,
    history: Mutex<Vec<String>>,
}

impl MockKeyValueStore {
    /// Create new mock store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: MemoryKeyValueStore::new(name),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_key: Mutex::new(None),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Make every operation fail.
    pub fn set_should_fail(&self, should_fail: bool) -> &Self {
        self.fail_reads.store(should_fail, Ordering::SeqCst);
        self.fail_writes.store(should_fail, Ordering::SeqCst);
        self
    }

    /// Make writes and removals fail while reads succeed.
    pub fn set_fail_writes(&self, fail: bool) -> &Self {
        self.fail_writes.store(fail, Ordering::SeqCst);
        self
    }

    /// Make writes to one key fail.
    pub fn set_fail_key(&self, key: Option<&str>) -> &Self {
        *self.fail_key.lock() = key.map(String::from);
        self
    }

    /// Write a raw value, bypassing failure injection.
    pub fn insert_raw(&self, key: &str, value: &str) -> &Self {
        self.inner.values.lock().insert(key.to_string(), value.to_string());
        self
    }

    /// Read a raw value, bypassing failure injection.
    pub fn get_raw(&self, key: &str) -> Option<String> {
        self.inner.values.lock().get(key).cloned()
    }

    /// Operations seen, as `"op:key"`.
    pub fn get_history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    fn log(&self, op: &str, key: &str) {
        self.history.lock().push(format!("{}:{}", op, key));
    }
}

#[async_trait]
impl KeyValueStore for MockKeyValueStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.log("get", key);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::ReadFailed {
                tier: self.inner.name.clone(),
                message: "mock read failure".to_string(),
            });
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.log("set", key);
        let key_fails = self.fail_key.lock().as_deref() == Some(key);
        if key_fails || self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteFailed {
                tier: self.inner.name.clone(),
                message: "mock write failure".to_string(),
            });
        }
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.log("remove", key);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::DeleteFailed {
                tier: self.inner.name.clone(),
                message: "mock delete failure".to_string(),
            });
        }
        self.inner.remove(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::new("file", dir.path().join("tokens"));

        assert_eq!(store.get("marketplace_token").await.unwrap(), None);
        store.set("marketplace_token", "{\"a\":1}").await.unwrap();
        assert_eq!(
            store.get("marketplace_token").await.unwrap().as_deref(),
            Some("{\"a\":1}")
        );

        store.remove("marketplace_token").await.unwrap();
        store.remove("marketplace_token").await.unwrap();
        assert_eq!(store.get("marketplace_token").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_sanitizes_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::new("file", dir.path());
        store.set("../escape/attempt", "x").await.unwrap();

        assert!(dir.path().join(".._escape_attempt.json").exists());
        assert_eq!(store.get("../escape/attempt").await.unwrap().as_deref(), Some("x"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_store_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::new("file", dir.path());
        store.set("k", "v").await.unwrap();

        let mode = std::fs::metadata(dir.path().join("k.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_mock_store_failure_injection() {
        let store = MockKeyValueStore::new("mock");
        store.set("k", "v").await.unwrap();

        store.set_should_fail(true);
        assert!(store.get("k").await.is_err());
        assert!(store.set("k", "w").await.is_err());
        assert_eq!(store.get_raw("k").as_deref(), Some("v"));

        assert_eq!(store.get_history(), vec!["set:k", "get:k", "set:k"]);
    }
}

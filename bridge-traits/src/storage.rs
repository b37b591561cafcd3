//! Key/Value Storage Abstractions
//!
//! Provides the storage capability the auth core persists into, the mutation
//! notifications some hosts can deliver for writes made by *other* execution
//! contexts, and the closed set of persistence backends the core can be
//! configured with.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::error::Result;

/// Key written to check whether a backend accepts writes.
pub const AVAILABILITY_CHECK_KEY: &str = "__sak";

/// Scope of a persistence backend.
///
/// - `Volatile`: lives only as long as the current execution context
/// - `TabScoped`: survives reloads of one tab/window, not shared with siblings
/// - `OriginScoped`: survives reloads and is shared by every same-origin context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageScope {
    Volatile,
    TabScoped,
    OriginScoped,
}

impl StorageScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageScope::Volatile => "volatile",
            StorageScope::TabScoped => "tab",
            StorageScope::OriginScoped => "origin",
        }
    }
}

impl fmt::Display for StorageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write observed on a shared backend.
///
/// `new_value` is `None` when the key was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageMutation {
    pub key: String,
    pub new_value: Option<String>,
}

/// Receiver half of a native mutation feed.
pub type MutationReceiver = broadcast::Receiver<StorageMutation>;

/// Key/value storage capability
///
/// Abstracts the string storage primitives a host offers:
/// - Browser: `sessionStorage`, `localStorage`, IndexedDB
/// - Desktop: in-process shared maps, JSON files
///
/// Every call completes before returning; implementations backed by
/// asynchronous primitives must await the underlying write.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::KeyValueStorage;
///
/// async fn remember(storage: &dyn KeyValueStorage) -> Result<()> {
///     storage.set("identity:authUser:key:app", "{...}").await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Read a value. Returns `Ok(None)` if the key doesn't exist.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value. Removing a missing key succeeds.
    async fn remove(&self, key: &str) -> Result<()>;

    /// List keys starting with `prefix`.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Check whether the storage accepts writes in the current environment.
    ///
    /// The default implementation writes and removes a throwaway key.
    async fn is_available(&self) -> bool {
        if self.set(AVAILABILITY_CHECK_KEY, "1").await.is_err() {
            return false;
        }
        self.remove(AVAILABILITY_CHECK_KEY).await.is_ok()
    }

    /// Subscribe to writes made by other execution contexts.
    ///
    /// Returns `None` when the host cannot notify, in which case callers
    /// have to poll.
    fn watch(&self) -> Option<MutationReceiver> {
        None
    }
}

/// Closed set of persistence backends the core can be configured with.
///
/// The variant carries the scope; the storage carries the capability.
#[derive(Clone)]
pub enum PersistenceBackend {
    Volatile(Arc<dyn KeyValueStorage>),
    TabScoped(Arc<dyn KeyValueStorage>),
    OriginScoped(Arc<dyn KeyValueStorage>),
}

impl PersistenceBackend {
    /// In-memory backend private to the current execution context.
    pub fn volatile() -> Self {
        PersistenceBackend::Volatile(Arc::new(MemoryStorage::new()))
    }

    pub fn tab_scoped(storage: Arc<dyn KeyValueStorage>) -> Self {
        PersistenceBackend::TabScoped(storage)
    }

    pub fn origin_scoped(storage: Arc<dyn KeyValueStorage>) -> Self {
        PersistenceBackend::OriginScoped(storage)
    }

    pub fn scope(&self) -> StorageScope {
        match self {
            PersistenceBackend::Volatile(_) => StorageScope::Volatile,
            PersistenceBackend::TabScoped(_) => StorageScope::TabScoped,
            PersistenceBackend::OriginScoped(_) => StorageScope::OriginScoped,
        }
    }

    pub fn storage(&self) -> &Arc<dyn KeyValueStorage> {
        match self {
            PersistenceBackend::Volatile(storage)
            | PersistenceBackend::TabScoped(storage)
            | PersistenceBackend::OriginScoped(storage) => storage,
        }
    }
}

impl fmt::Debug for PersistenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceBackend")
            .field("scope", &self.scope())
            .finish()
    }
}

/// In-memory storage used for the volatile backend and in tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("a").await.unwrap(), None);

        storage.set("a", "1").await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), Some("1".to_string()));

        storage.remove("a").await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_storage_list_keys_by_prefix() {
        let storage = MemoryStorage::new();
        storage.set("identity:authUser:k:app", "u").await.unwrap();
        storage.set("identity:pending:popup:k:app", "p").await.unwrap();
        storage.set("other", "x").await.unwrap();

        let keys = storage.list_keys("identity:").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.starts_with("identity:")));
    }

    #[tokio::test]
    async fn test_memory_storage_is_available_and_leaves_no_check_key() {
        let storage = MemoryStorage::new();
        assert!(storage.is_available().await);
        assert!(storage.list_keys("").await.unwrap().is_empty());
    }

    #[test]
    fn test_backend_scope() {
        assert_eq!(PersistenceBackend::volatile().scope(), StorageScope::Volatile);

        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        assert_eq!(
            PersistenceBackend::tab_scoped(storage.clone()).scope(),
            StorageScope::TabScoped
        );
        assert_eq!(
            PersistenceBackend::origin_scoped(storage).scope(),
            StorageScope::OriginScoped
        );
    }

    #[test]
    fn test_memory_storage_has_no_native_feed() {
        assert!(MemoryStorage::new().watch().is_none());
    }
}

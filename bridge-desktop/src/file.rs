//! JSON file-backed storage using Tokio

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::KeyValueStorage,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

type Entries = BTreeMap<String, String>;

const LOCK_RETRY: Duration = Duration::from_millis(5);
/// A lock held longer than this is assumed to belong to a crashed writer.
const STALE_LOCK: Duration = Duration::from_secs(5);

/// Durable key/value storage kept in a single JSON object on disk.
///
/// Any number of handles (in one process or several) may open the same
/// path. Reads always go to the file, so a handle sees what the others
/// wrote. Writes re-read the file under `<path>.lock`, apply the one change
/// and replace the file through a temporary file private to the handle, so
/// concurrent writers never drop each other's keys and a crash never leaves
/// a half-written file. A file that fails to parse reads as empty.
///
/// There is no mutation feed; callers poll.
pub struct FileStorage {
    path: PathBuf,
    lock_path: PathBuf,
    tmp_path: PathBuf,
    /// Serializes this handle's own writers before they touch the lock file.
    writer: Mutex<()>,
}

impl FileStorage {
    /// Open (or create on first write) the store at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(BridgeError::Io)?;
        }

        let storage = Self {
            lock_path: sibling(&path, "lock"),
            tmp_path: sibling(&path, &format!("{}.tmp", Uuid::new_v4().simple())),
            path,
            writer: Mutex::new(()),
        };

        let entries = storage.load().await?;
        debug!(path = ?storage.path, entries = entries.len(), "Opened file storage");
        Ok(storage)
    }

    /// Open `identity-session/<file_name>` under the platform data directory.
    pub async fn in_data_dir(file_name: &str) -> Result<Self> {
        let base = dirs::data_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
            .ok_or_else(|| BridgeError::storage_unavailable("no data directory"))?;
        Self::open(base.join("identity-session").join(file_name)).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Entries> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(entries) => Ok(entries),
                Err(e) => {
                    warn!(path = ?self.path, error = %e, "Storage file is corrupted, reading as empty");
                    Ok(Entries::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Entries::new()),
            Err(e) => Err(BridgeError::Io(e)),
        }
    }

    /// Apply `change` to the current file contents and write them back.
    ///
    /// Returns whether anything was written.
    async fn update<F>(&self, change: F) -> Result<bool>
    where
        F: FnOnce(&mut Entries) -> bool,
    {
        let _writer = self.writer.lock().await;
        let _lock = LockFile::acquire(&self.lock_path).await?;

        let mut entries = self.load().await?;
        if !change(&mut entries) {
            return Ok(false);
        }
        self.flush(&entries).await?;
        Ok(true)
    }

    async fn flush(&self, entries: &Entries) -> Result<()> {
        let serialized = serde_json::to_vec_pretty(entries)
            .map_err(|e| BridgeError::Encoding(e.to_string()))?;

        let mut file = fs::File::create(&self.tmp_path)
            .await
            .map_err(BridgeError::Io)?;
        file.write_all(&serialized).await.map_err(BridgeError::Io)?;
        file.sync_all().await.map_err(BridgeError::Io)?;
        drop(file);

        if let Err(e) = fs::rename(&self.tmp_path, &self.path).await {
            let _ = fs::remove_file(&self.tmp_path).await;
            return Err(BridgeError::Io(e));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStorage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        })
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.update(|entries| entries.remove(key).is_some()).await?;
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .load()
            .await?
            .into_keys()
            .filter(|key| key.starts_with(prefix))
            .collect())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Exclusive `<path>.lock` marker, removed on drop.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    async fn acquire(path: &Path) -> Result<Self> {
        let mut waiting_since = Instant::now();
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if waiting_since.elapsed() >= STALE_LOCK {
                        warn!(path = ?path, "Breaking stale storage lock");
                        let _ = fs::remove_file(path).await;
                        waiting_since = Instant::now();
                        continue;
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(BridgeError::Io(e)),
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = ?self.path, error = %e, "Failed to release storage lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");

        let storage = FileStorage::open(&path).await.unwrap();
        storage.set("identity:authUser:k:app", "{}").await.unwrap();
        drop(storage);

        let reopened = FileStorage::open(&path).await.unwrap();
        assert_eq!(
            reopened.get("identity:authUser:k:app").await.unwrap(),
            Some("{}".to_string())
        );
    }

    #[tokio::test]
    async fn test_remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");

        let storage = FileStorage::open(&path).await.unwrap();
        storage.set("a", "1").await.unwrap();
        storage.remove("a").await.unwrap();
        storage.remove("missing").await.unwrap();

        let reopened = FileStorage::open(&path).await.unwrap();
        assert!(reopened.list_keys("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let storage = FileStorage::open(&path).await.unwrap();
        assert!(storage.list_keys("").await.unwrap().is_empty());
        assert!(storage.is_available().await);
    }

    #[tokio::test]
    async fn test_handles_on_one_path_share_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        let a = FileStorage::open(&path).await.unwrap();
        let b = FileStorage::open(&path).await.unwrap();

        a.set("user", "u-1").await.unwrap();
        assert_eq!(b.get("user").await.unwrap(), Some("u-1".to_string()));

        b.set("marker", "m").await.unwrap();
        assert_eq!(a.get("user").await.unwrap(), Some("u-1".to_string()));
        assert_eq!(a.get("marker").await.unwrap(), Some("m".to_string()));

        a.remove("marker").await.unwrap();
        assert_eq!(b.list_keys("").await.unwrap(), vec!["user".to_string()]);

        let reopened = FileStorage::open(&path).await.unwrap();
        assert_eq!(reopened.get("user").await.unwrap(), Some("u-1".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_keep_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");

        let mut writers = Vec::new();
        for i in 0..4 {
            let storage = FileStorage::open(&path).await.unwrap();
            writers.push(tokio::spawn(async move {
                for j in 0..5 {
                    storage
                        .set(&format!("key-{}-{}", i, j), "v")
                        .await
                        .unwrap();
                }
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }

        let storage = FileStorage::open(&path).await.unwrap();
        assert_eq!(storage.list_keys("key-").await.unwrap().len(), 20);
        assert!(!dir.path().join("auth.json.lock").exists());
    }
}

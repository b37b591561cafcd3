//! Tab-scoped session storage

use async_trait::async_trait;
use bridge_traits::{error::Result, storage::KeyValueStorage};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Storage private to one tab that survives reloads of that tab.
///
/// Clones share the same entries: the host keeps one handle per tab and
/// passes a clone to every core instance it creates for that tab. Nothing
/// is ever published to other contexts.
#[derive(Debug, Clone, Default)]
pub struct TabSessionStorage {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl TabSessionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStorage for TabSessionStorage {
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
    async fn test_clone_survives_reload() {
        let tab = TabSessionStorage::new();
        let before_reload = tab.clone();
        before_reload.set("k", "v").await.unwrap();
        drop(before_reload);

        assert_eq!(tab.get("k").await.unwrap(), Some("v".to_string()));
        assert!(tab.watch().is_none());
    }
}

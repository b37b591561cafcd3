//! Origin-shared storage with cross-context mutation feeds

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    storage::{KeyValueStorage, MutationReceiver, StorageMutation},
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};
use uuid::Uuid;

const FEED_CAPACITY: usize = 64;

/// Identifies one execution context attached to an origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct OriginShared {
    entries: RwLock<BTreeMap<String, String>>,
    feeds: Mutex<HashMap<ContextId, broadcast::Sender<StorageMutation>>>,
}

impl OriginShared {
    /// Deliver a mutation to every context except its author.
    fn publish(&self, author: ContextId, mutation: StorageMutation) {
        let feeds = match self.feeds.lock() {
            Ok(feeds) => feeds,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (context, sender) in feeds.iter() {
            if *context == author {
                continue;
            }
            // No receivers yet is fine; the context may not be watching.
            let _ = sender.send(mutation.clone());
        }
        trace!(key = %mutation.key, author = %author, "Published storage mutation");
    }
}

/// Storage shared by all execution contexts of one origin.
///
/// `OriginStorage` itself is the origin; call [`OriginStorage::context`] to
/// attach a context (a tab, a window, a worker). Each context handle sees
/// the same entries, and its [`watch`](KeyValueStorage::watch) feed reports
/// the writes made by the *other* contexts, never its own.
#[derive(Clone, Default)]
pub struct OriginStorage {
    shared: Arc<OriginShared>,
}

impl OriginStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new execution context to this origin.
    pub fn context(&self) -> OriginContext {
        let id = ContextId::new();
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        match self.shared.feeds.lock() {
            Ok(mut feeds) => {
                feeds.insert(id, sender.clone());
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(id, sender.clone());
            }
        }
        debug!(context = %id, "Attached execution context to origin");

        OriginContext {
            id,
            shared: Arc::clone(&self.shared),
            feed: sender,
        }
    }
}

/// One execution context's view of an [`OriginStorage`].
pub struct OriginContext {
    id: ContextId,
    shared: Arc<OriginShared>,
    feed: broadcast::Sender<StorageMutation>,
}

impl OriginContext {
    pub fn id(&self) -> ContextId {
        self.id
    }
}

impl Drop for OriginContext {
    fn drop(&mut self) {
        if let Ok(mut feeds) = self.shared.feeds.lock() {
            feeds.remove(&self.id);
        }
    }
}

#[async_trait]
impl KeyValueStorage for OriginContext {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.shared.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.shared
            .entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        self.shared.publish(
            self.id,
            StorageMutation {
                key: key.to_string(),
                new_value: Some(value.to_string()),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let existed = self.shared.entries.write().await.remove(key).is_some();
        if existed {
            self.shared.publish(
                self.id,
                StorageMutation {
                    key: key.to_string(),
                    new_value: None,
                },
            );
        }
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .shared
            .entries
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn watch(&self) -> Option<MutationReceiver> {
        Some(self.feed.subscribe())
    }
}

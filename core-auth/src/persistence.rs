//! Persistence Store
//!
//! Fronts the active [`PersistenceBackend`] for one logical namespace.
//!
//! ## Self-change tagging
//!
//! Every write made through the store records the value in a shared
//! last-seen map *before* the backend write commits. The change bus
//! compares incoming notifications against the same map, so this context
//! never reacts to its own writes.
//!
//! ## Backend migration
//!
//! [`PersistenceStore::switch_backend`] copies the record to the new
//! backend, clears it from the old one, then swaps. If the copy fails the
//! old backend is untouched; if clearing the old copy fails the new copy is
//! rolled back. Either way exactly one persisted copy remains.

use crate::error::{AuthError, Result};
use bridge_traits::{PersistenceBackend, StorageScope};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

/// Result of comparing a key against the last value this context saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Polled {
    /// First look at the key; recorded without a change
    Seeded,
    Unchanged,
    /// Another context wrote; `None` means removed
    Changed(Option<String>),
}

pub struct PersistenceStore {
    active: RwLock<PersistenceBackend>,
    /// Last value this context saw (or wrote) per key. `None` means absent.
    observed: Mutex<HashMap<String, Option<String>>>,
}

impl PersistenceStore {
    /// Open a store on `backend`, failing closed if it is unusable here.
    #[instrument(skip_all, fields(scope = %backend.scope()))]
    pub async fn open(backend: PersistenceBackend) -> Result<Self> {
        ensure_available(&backend).await?;
        debug!("Persistence backend ready");

        Ok(Self {
            active: RwLock::new(backend),
            observed: Mutex::new(HashMap::new()),
        })
    }

    pub async fn backend(&self) -> PersistenceBackend {
        self.active.read().await.clone()
    }

    pub async fn scope(&self) -> StorageScope {
        self.active.read().await.scope()
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let backend = self.active.read().await;
        Ok(backend.storage().get(key).await?)
    }

    /// Read `key` and record the result as the last value seen.
    pub(crate) async fn read_observed(&self, key: &str) -> Result<Option<String>> {
        let backend = self.active.read().await;
        let mut observed = self.observed.lock().await;

        let value = backend.storage().get(key).await?;
        observed.insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// Write `value`, tagging it as seen before the write commits.
    ///
    /// The tag is held for the whole write so a concurrent poll never
    /// mistakes the old value for a foreign change.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let backend = self.active.read().await;
        let mut observed = self.observed.lock().await;
        let previous = observed.insert(key.to_string(), Some(value.to_string()));

        if let Err(e) = backend.storage().set(key, value).await {
            restore(&mut observed, key, previous);
            warn!(key = %key, error = %e, "Failed to write record");
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        let backend = self.active.read().await;
        let mut observed = self.observed.lock().await;
        let previous = observed.insert(key.to_string(), None);

        if let Err(e) = backend.storage().remove(key).await {
            restore(&mut observed, key, previous);
            warn!(key = %key, error = %e, "Failed to remove record");
            return Err(e.into());
        }
        Ok(())
    }

    /// Re-read `key` and diff it against the last value seen.
    pub(crate) async fn poll_key(&self, key: &str) -> Result<Polled> {
        let backend = self.active.read().await;
        let mut observed = self.observed.lock().await;

        let current = backend.storage().get(key).await?;
        match observed.insert(key.to_string(), current.clone()) {
            None => Ok(Polled::Seeded),
            Some(previous) if previous == current => Ok(Polled::Unchanged),
            Some(_) => Ok(Polled::Changed(current)),
        }
    }

    /// Re-read `key` after the backend reported a write to it.
    ///
    /// Unlike [`poll_key`](Self::poll_key) a key with no last-seen value
    /// counts as changed, since a foreign write is known to have happened.
    pub(crate) async fn reread_notified(&self, key: &str) -> Result<Polled> {
        let backend = self.active.read().await;
        let mut observed = self.observed.lock().await;

        let current = backend.storage().get(key).await?;
        match observed.insert(key.to_string(), current.clone()) {
            Some(previous) if previous == current => Ok(Polled::Unchanged),
            _ => Ok(Polled::Changed(current)),
        }
    }

    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let backend = self.active.read().await;
        Ok(backend.storage().list_keys(prefix).await?)
    }

    /// Make `backend` the active backend, migrating the record at `key`.
    ///
    /// Order: read old, write new, clear old, swap.
    #[instrument(skip(self, backend), fields(to = %backend.scope()))]
    pub async fn switch_backend(&self, backend: PersistenceBackend, key: &str) -> Result<()> {
        let mut active = self.active.write().await;
        let mut observed = self.observed.lock().await;

        if Arc::ptr_eq(active.storage(), backend.storage()) {
            debug!("Backend unchanged, only the scope tag is updated");
            *active = backend;
            return Ok(());
        }

        ensure_available(&backend).await?;

        let from = active.scope();
        let value = active.storage().get(key).await?;

        if let Some(value) = value.as_deref() {
            backend.storage().set(key, value).await.map_err(|e| {
                warn!(error = %e, "Copy to new backend failed, old backend left untouched");
                AuthError::from(e)
            })?;

            if let Err(e) = active.storage().remove(key).await {
                warn!(error = %e, "Clearing old backend failed, rolling back copy");
                if let Err(rollback) = backend.storage().remove(key).await {
                    warn!(error = %rollback, "Rollback of migrated copy failed");
                }
                return Err(e.into());
            }
        }

        *active = backend;
        observed.insert(key.to_string(), value);

        info!(from = %from, to = %active.scope(), "Switched persistence backend");
        Ok(())
    }
}

fn restore(
    observed: &mut HashMap<String, Option<String>>,
    key: &str,
    previous: Option<Option<String>>,
) {
    match previous {
        Some(previous) => observed.insert(key.to_string(), previous),
        None => observed.remove(key),
    };
}

async fn ensure_available(backend: &PersistenceBackend) -> Result<()> {
    if backend.storage().is_available().await {
        Ok(())
    } else {
        warn!(scope = %backend.scope(), "Persistence backend unavailable");
        Err(AuthError::StorageUnsupported {
            scope: backend.scope(),
        })
    }
}

//! Change Event Bus
//!
//! Turns storage mutation signals into a deduplicated stream of changes
//! made by *other* execution contexts.
//!
//! ## Sources
//!
//! - Backends with a native feed ([`KeyValueStorage::watch`]) are
//!   subscribed directly.
//! - Everything else is polled every `poll_interval` and diffed against the
//!   last value this context saw.
//!
//! Both paths re-read the backend and diff against the store's last-seen
//! map, which is also where this context's own writes are tagged, so
//! self-originated writes never surface as events and a stale notification
//! never wins over the value actually stored.
//!
//! ## Delivery
//!
//! Listeners for a key run in registration order. A panicking listener is
//! logged and skipped; the remaining listeners and the bus keep running.
//!
//! [`KeyValueStorage::watch`]: bridge_traits::KeyValueStorage::watch

use crate::persistence::{PersistenceStore, Polled};
use bridge_traits::{MutationReceiver, StorageMutation};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A change to a persisted key made outside this execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: String,
    /// Serialized value, `None` when the key was removed
    pub new_value: Option<String>,
}

pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: BTreeMap<u64, (String, ChangeListener)>,
}

impl Registry {
    fn watched_keys(&self) -> BTreeSet<String> {
        self.listeners.values().map(|(key, _)| key.clone()).collect()
    }

    fn listeners_for(&self, key: &str) -> Vec<ChangeListener> {
        self.listeners
            .values()
            .filter(|(watched, _)| watched == key)
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }
}

type SharedRegistry = Arc<Mutex<Registry>>;

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ChangeBus {
    store: Arc<PersistenceStore>,
    registry: SharedRegistry,
    poll_interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl ChangeBus {
    /// Bind a bus to `store` and start listening.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(store: Arc<PersistenceStore>, poll_interval: Duration) -> Self {
        let bus = Self {
            store,
            registry: Arc::new(Mutex::new(Registry::default())),
            poll_interval,
            worker: Mutex::new(None),
        };
        bus.spawn_worker().await;
        bus
    }

    /// Register `listener` for changes of `key`.
    pub fn subscribe<F>(&self, key: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let key = key.into();
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.insert(id, (key.clone(), Arc::new(listener)));
        debug!(key = %key, subscription = id, "Change listener registered");

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Rebind to the store's current backend.
    ///
    /// Called after the active backend was switched so the native feed (or
    /// the lack of one) matches the new backend.
    pub async fn restart(&self) {
        self.stop_worker();
        self.spawn_worker().await;
        info!("Change bus rebound to active backend");
    }

    /// Stop listening and drop every subscription.
    pub fn shutdown(&self) {
        self.stop_worker();
        lock(&self.registry).listeners.clear();
        debug!("Change bus shut down");
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|worker| worker.as_ref().is_some_and(|w| !w.handle.is_finished()))
            .unwrap_or(false)
    }

    async fn spawn_worker(&self) {
        let feed = self.store.backend().await.storage().watch();
        if feed.is_some() {
            debug!("Using native mutation feed");
        } else {
            debug!(interval_ms = self.poll_interval.as_millis() as u64, "Polling for changes");
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            feed,
            self.poll_interval,
            cancel.clone(),
        ));

        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(Worker { cancel, handle });
        }
    }

    fn stop_worker(&self) {
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            worker.cancel.cancel();
        }
    }
}

impl Drop for ChangeBus {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

/// Handle returned by [`ChangeBus::subscribe`].
#[must_use = "dropping the handle keeps the listener registered; call unsubscribe() to remove it"]
pub struct Subscription {
    id: u64,
    registry: std::sync::Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).listeners.remove(&self.id);
        }
    }
}

async fn run(
    store: Arc<PersistenceStore>,
    registry: SharedRegistry,
    mut feed: Option<MutationReceiver>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let polling = feed.is_none();
        tokio::select! {
            _ = cancel.cancelled() => break,
            mutation = next_mutation(&mut feed) => match mutation {
                Ok(mutation) => on_mutation(&store, &registry, mutation).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Mutation feed lagged, resynchronizing");
                    poll(&store, &registry).await;
                }
                Err(RecvError::Closed) => {
                    warn!("Mutation feed closed, falling back to polling");
                    feed = None;
                }
            },
            _ = ticker.tick(), if polling => poll(&store, &registry).await,
        }
    }

    debug!("Change bus worker stopped");
}

async fn next_mutation(feed: &mut Option<MutationReceiver>) -> Result<StorageMutation, RecvError> {
    match feed {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

/// A feed entry only wakes the worker; the value dispatched is what the
/// backend holds now, so a write this context made after the notified one
/// is never overridden.
async fn on_mutation(store: &PersistenceStore, registry: &SharedRegistry, mutation: StorageMutation) {
    let watched = lock(registry).watched_keys();
    if !watched.contains(&mutation.key) {
        return;
    }

    match store.reread_notified(&mutation.key).await {
        Ok(Polled::Changed(new_value)) => dispatch(
            registry,
            ChangeEvent {
                key: mutation.key,
                new_value,
            },
        ),
        Ok(Polled::Seeded) | Ok(Polled::Unchanged) => {}
        Err(e) => warn!(key = %mutation.key, error = %e, "Re-read after mutation failed"),
    }
}

async fn poll(store: &PersistenceStore, registry: &SharedRegistry) {
    let watched = lock(registry).watched_keys();

    for key in watched {
        match store.poll_key(&key).await {
            Ok(Polled::Changed(new_value)) => dispatch(registry, ChangeEvent { key, new_value }),
            Ok(Polled::Seeded) | Ok(Polled::Unchanged) => {}
            Err(e) => warn!(key = %key, error = %e, "Poll read failed, retrying next tick"),
        }
    }
}

fn dispatch(registry: &SharedRegistry, event: ChangeEvent) {
    let listeners = lock(registry).listeners_for(&event.key);
    debug!(key = %event.key, removed = event.new_value.is_none(), listeners = listeners.len(), "Dispatching change");

    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
            error!(key = %event.key, "Change listener panicked");
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> std::sync::MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

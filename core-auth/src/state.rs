//! # Auth State Manager
//!
//! Owns the current [`UserRecord`] and the [`AuthState`] lifecycle.
//!
//! ## Single-flight dispatch
//!
//! Every mutation (local install, sign-out, cross-context change, observer
//! registration) is a command on one queue, drained by one dispatch task.
//! A broadcast to observers therefore always completes before the next
//! command is looked at, and observers are called in registration order.
//!
//! ## Initial load
//!
//! The dispatch task reads the persisted user before draining the queue.
//! Observers registered while the manager is `Loading` sit in the queue and
//! are greeted with the loaded snapshot exactly once.

use crate::change_bus::{ChangeBus, ChangeEvent, Subscription};
use crate::error::{AuthError, Result};
use crate::persistence::PersistenceStore;
use crate::record::{self, RecordType};
use crate::types::{AuthState, UserRecord};
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Point-in-time view of the auth state handed to observers.
#[derive(Debug, Clone, Default)]
pub struct AuthSnapshot {
    pub state: AuthState,
    pub user: Option<Arc<UserRecord>>,
}

impl AuthSnapshot {
    fn resolved(user: Option<Arc<UserRecord>>) -> Self {
        let state = if user.is_some() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        };
        Self { state, user }
    }
}

pub type AuthObserver = Arc<dyn Fn(&AuthSnapshot) + Send + Sync>;

enum Command {
    Install {
        user: UserRecord,
        ack: oneshot::Sender<Result<Arc<UserRecord>>>,
    },
    SignOut {
        ack: oneshot::Sender<Result<()>>,
    },
    External(ChangeEvent),
    Register {
        id: u64,
        observer: AuthObserver,
    },
    Unregister(u64),
}

pub struct AuthStateManager {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<AuthSnapshot>,
    next_observer: AtomicU64,
    cancel: CancellationToken,
    subscription: Mutex<Option<Subscription>>,
}

impl AuthStateManager {
    /// Enter `Loading` and start the dispatch task.
    ///
    /// Changes of `user_key` reported by `bus` are adopted as
    /// cross-context updates.
    pub fn start(
        store: Arc<PersistenceStore>,
        bus: &ChangeBus,
        user_key: impl Into<String>,
        events: EventBus,
    ) -> Self {
        let user_key = user_key.into();
        let (commands, queue) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(AuthSnapshot::default());

        snapshot_tx.send_replace(AuthSnapshot {
            state: AuthState::Loading,
            user: None,
        });
        debug!(key = %user_key, "Auth state loading");

        let external = commands.clone();
        let subscription = bus.subscribe(user_key.clone(), move |event| {
            // A closed queue means the manager is gone.
            let _ = external.send(Command::External(event.clone()));
        });

        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher {
            store,
            user_key,
            events,
            snapshot: snapshot_tx,
            observers: BTreeMap::new(),
        };
        tokio::spawn(dispatcher.run(queue, cancel.clone()));

        Self {
            commands,
            snapshot,
            next_observer: AtomicU64::new(0),
            cancel,
            subscription: Mutex::new(Some(subscription)),
        }
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> AuthState {
        self.snapshot.borrow().state
    }

    pub fn current_user(&self) -> Option<Arc<UserRecord>> {
        self.snapshot.borrow().user.clone()
    }

    /// Wait for the initial load to finish.
    pub async fn wait_until_resolved(&self) -> Result<AuthSnapshot> {
        let mut receiver = self.snapshot.clone();
        let snapshot = receiver
            .wait_for(|snapshot| snapshot.state.is_resolved())
            .await
            .map_err(|_| stopped())?;
        Ok(snapshot.clone())
    }

    /// Register `observer`.
    ///
    /// The observer is first called with the current snapshot (after the
    /// initial load), then once per change.
    pub fn register<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&AuthSnapshot) + Send + Sync + 'static,
    {
        let id = self.next_observer.fetch_add(1, Ordering::SeqCst);
        if self
            .commands
            .send(Command::Register {
                id,
                observer: Arc::new(observer),
            })
            .is_err()
        {
            warn!(observer = id, "Observer registered after shutdown");
        }

        ObserverHandle {
            id,
            commands: self.commands.clone(),
        }
    }

    /// Persist `user` as the current user, then notify observers.
    #[instrument(skip(self, user), fields(uid = %user.uid))]
    pub async fn install(&self, user: UserRecord) -> Result<Arc<UserRecord>> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Install { user, ack })
            .map_err(|_| stopped())?;
        done.await.map_err(|_| stopped())?
    }

    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::SignOut { ack })
            .map_err(|_| stopped())?;
        done.await.map_err(|_| stopped())?
    }

    /// Stop the dispatch task and detach from the change bus.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let subscription = self.subscription.lock().ok().and_then(|mut s| s.take());
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
    }
}

impl Drop for AuthStateManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Returned by [`AuthStateManager::register`].
#[must_use = "dropping the handle keeps the observer registered; call unsubscribe() to remove it"]
pub struct ObserverHandle {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl ObserverHandle {
    pub fn unsubscribe(self) {
        let _ = self.commands.send(Command::Unregister(self.id));
    }
}

fn stopped() -> AuthError {
    AuthError::Internal("auth state manager stopped".to_string())
}

struct Dispatcher {
    store: Arc<PersistenceStore>,
    user_key: String,
    events: EventBus,
    snapshot: watch::Sender<AuthSnapshot>,
    observers: BTreeMap<u64, AuthObserver>,
}

impl Dispatcher {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = self.load() => {}
        }

        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => break,
                command = queue.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command).await;
        }

        debug!("Auth state dispatcher stopped");
    }

    async fn load(&mut self) {
        let user = match self.store.read_observed(&self.user_key).await {
            Ok(Some(raw)) => match record::decode::<UserRecord>(&raw, RecordType::User) {
                Ok(user) => Some(Arc::new(user)),
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable user record");
                    if let Err(e) = self.store.remove(&self.user_key).await {
                        warn!(error = %e, "Failed to remove unreadable user record");
                    }
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read user record, starting signed out");
                None
            }
        };

        let snapshot = AuthSnapshot::resolved(user);
        info!(state = %snapshot.state, "Auth state resolved");
        self.snapshot.send_replace(snapshot);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Install { user, ack } => {
                let result = self.install(user).await;
                let _ = ack.send(result);
            }
            Command::SignOut { ack } => {
                let result = self.sign_out().await;
                let _ = ack.send(result);
            }
            Command::External(event) => self.external(event).await,
            Command::Register { id, observer } => {
                let snapshot = self.snapshot.borrow().clone();
                notify(id, &observer, &snapshot);
                self.observers.insert(id, observer);
            }
            Command::Unregister(id) => {
                self.observers.remove(&id);
            }
        }
    }

    async fn install(&mut self, user: UserRecord) -> Result<Arc<UserRecord>> {
        let raw = record::encode(RecordType::User, &user)?;
        self.store.set(&self.user_key, &raw).await?;

        let user = Arc::new(user);
        self.transition(Some(Arc::clone(&user)), false);
        Ok(user)
    }

    async fn sign_out(&mut self) -> Result<()> {
        self.store.remove(&self.user_key).await?;
        if self.snapshot.borrow().user.is_none() {
            debug!("Sign-out without a current user, nothing to announce");
            return Ok(());
        }
        self.transition(None, false);
        Ok(())
    }

    /// Adopt whatever the store holds now. The event only says that the
    /// key moved; by the time it is handled this context may have written
    /// over the value it carries.
    async fn external(&mut self, event: ChangeEvent) {
        if event.key != self.user_key {
            return;
        }

        let stored = match self.store.read_observed(&self.user_key).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Failed to re-read user record after foreign change");
                return;
            }
        };

        let incoming = match stored.as_deref() {
            None => None,
            Some(raw) => match record::decode::<UserRecord>(raw, RecordType::User) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(error = %e, "Unreadable user record written elsewhere, treating as signed out");
                    None
                }
            },
        };

        let current = self.snapshot.borrow().user.clone();
        let unchanged = match (&current, &incoming) {
            (None, None) => true,
            (Some(current), Some(incoming)) => current.as_ref() == incoming,
            _ => false,
        };
        if unchanged {
            debug!("Cross-context change matches current user, ignored");
            return;
        }

        self.transition(incoming.map(Arc::new), true);
    }

    fn transition(&mut self, user: Option<Arc<UserRecord>>, cross_context: bool) {
        let uid = user.as_ref().map(|user| user.uid.to_string());
        let snapshot = AuthSnapshot::resolved(user);
        self.snapshot.send_replace(snapshot.clone());

        info!(
            state = %snapshot.state,
            uid = uid.as_deref().unwrap_or("-"),
            cross_context,
            "Auth state changed"
        );

        for (id, observer) in &self.observers {
            notify(*id, observer, &snapshot);
        }

        let _ = self
            .events
            .emit(CoreEvent::Auth(AuthEvent::StateChanged { uid, cross_context }));
    }
}

fn notify(id: u64, observer: &AuthObserver, snapshot: &AuthSnapshot) {
    if catch_unwind(AssertUnwindSafe(|| observer(snapshot))).is_err() {
        error!(observer = id, "Auth state observer panicked");
    }
}

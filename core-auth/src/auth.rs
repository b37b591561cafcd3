//! # Auth context
//!
//! One [`Auth`] per application configuration. It binds the persistence
//! stores, the change bus, the state manager, the tracker and the resolver,
//! and exposes the public operation surface.
//!
//! ## Usage
//!
//! ```no_run
//! use core_auth::provider::OAuthProvider;
//! use core_auth::{Auth, AuthCollaborators};
//! use core_runtime::config::AuthConfig;
//! use bridge_traits::PersistenceBackend;
//! # use std::sync::Arc;
//! # async fn example(collaborators: AuthCollaborators) -> core_auth::Result<()> {
//! let config = AuthConfig::builder()
//!     .api_key("AIza...")
//!     .user_persistence(PersistenceBackend::volatile())
//!     .build()?;
//!
//! let auth = Auth::initialize(config, collaborators).await?;
//! let _handle = auth.on_auth_state_change(|snapshot| println!("{}", snapshot.state));
//!
//! let google = OAuthProvider::new(
//!     "google.com",
//!     "https://accounts.example.com/o/oauth2/auth",
//!     "client-id",
//!     "https://app.example.com/__/auth/handler",
//! )?;
//! let outcome = auth.begin_popup_sign_in(&google).await?;
//! println!("signed in: {}", outcome.is_success());
//! # Ok(())
//! # }
//! ```

use crate::backend::{ChallengeVerifier, IdentityBackend};
use crate::change_bus::ChangeBus;
use crate::error::{AuthError, Result};
use crate::keys::StorageKeys;
use crate::pending::PendingOperationTracker;
use crate::persistence::PersistenceStore;
use crate::provider::AuthProvider;
use crate::resolver::{CompletionMessage, PopupRedirectResolver, ResolverSettings};
use crate::state::{AuthSnapshot, AuthStateManager, ObserverHandle};
use crate::types::{AuthAction, AuthState, OperationKind, Outcome, UserCredential, UserRecord};
use crate::verification::{VerificationFlow, VerificationServices, VerificationSessionHandle};
use bridge_traits::{Clock, Navigator, PersistenceBackend, PopupLauncher, StorageScope, SystemClock};
use core_runtime::config::AuthConfig;
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Host capabilities and external services an [`Auth`] instance uses.
#[derive(Clone)]
pub struct AuthCollaborators {
    pub identity_backend: Arc<dyn IdentityBackend>,
    pub popup_launcher: Arc<dyn PopupLauncher>,
    pub navigator: Arc<dyn Navigator>,
    pub challenge_verifier: Arc<dyn ChallengeVerifier>,
    pub clock: Arc<dyn Clock>,
}

impl AuthCollaborators {
    pub fn new(
        identity_backend: Arc<dyn IdentityBackend>,
        popup_launcher: Arc<dyn PopupLauncher>,
        navigator: Arc<dyn Navigator>,
        challenge_verifier: Arc<dyn ChallengeVerifier>,
    ) -> Self {
        Self {
            identity_backend,
            popup_launcher,
            navigator,
            challenge_verifier,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub struct Auth {
    keys: StorageKeys,
    user_store: Arc<PersistenceStore>,
    bus: ChangeBus,
    state: Arc<AuthStateManager>,
    tracker: Arc<PendingOperationTracker>,
    resolver: PopupRedirectResolver,
    verification: VerificationServices,
    events: EventBus,
}

impl Auth {
    /// Build an auth context for `config`.
    ///
    /// Fails with `storage-unsupported` when a configured backend is not
    /// usable here. A redirect that began before this context existed is
    /// completed before this returns; its outcome is then available from
    /// [`Auth::get_pending_redirect_outcome`].
    #[instrument(skip_all, fields(app = %config.app_name))]
    pub async fn initialize(config: AuthConfig, collaborators: AuthCollaborators) -> Result<Self> {
        config.validate()?;

        let keys = StorageKeys::new(&config.api_key, &config.app_name);
        let user_store = Arc::new(PersistenceStore::open(config.user_persistence.clone()).await?);
        // Markers get their own store so switching the user backend leaves them put.
        let marker_store = Arc::new(PersistenceStore::open(config.marker_persistence.clone()).await?);

        let events = EventBus::new(config.event_buffer_size);
        let bus = ChangeBus::start(Arc::clone(&user_store), config.storage_poll_interval).await;
        let state = Arc::new(AuthStateManager::start(
            Arc::clone(&user_store),
            &bus,
            keys.user(),
            events.clone(),
        ));
        let tracker = Arc::new(PendingOperationTracker::new(
            marker_store,
            keys.clone(),
            Arc::clone(&collaborators.clock),
        ));

        let resolver = PopupRedirectResolver::new(
            Arc::clone(&tracker),
            Arc::clone(&state),
            Arc::clone(&collaborators.identity_backend),
            collaborators.popup_launcher,
            collaborators.navigator,
            events.clone(),
            ResolverSettings {
                api_key: config.api_key.clone(),
                app_name: config.app_name.clone(),
                tenant_id: config.tenant_id.clone(),
                popup_poll_interval: config.popup_poll_interval,
                popup_close_grace: config.popup_close_grace,
            },
        );
        resolver.resume_pending_redirect().await;

        let verification = VerificationServices {
            backend: collaborators.identity_backend,
            verifier: collaborators.challenge_verifier,
            tracker: Arc::clone(&tracker),
            state: Arc::clone(&state),
            events: events.clone(),
        };

        info!(
            user_scope = %config.user_persistence.scope(),
            marker_scope = %config.marker_persistence.scope(),
            "Auth initialized"
        );
        Ok(Self {
            keys,
            user_store,
            bus,
            state,
            tracker,
            resolver,
            verification,
            events,
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> AuthState {
        self.state.state()
    }

    pub fn current_user(&self) -> Option<Arc<UserRecord>> {
        self.state.current_user()
    }

    /// Current user, or `no-current-user`.
    pub fn require_user(&self) -> Result<Arc<UserRecord>> {
        self.current_user().ok_or(AuthError::NoCurrentUser)
    }

    /// Wait for the persisted user to be loaded.
    pub async fn auth_state_ready(&self) -> Result<AuthSnapshot> {
        self.state.wait_until_resolved().await
    }

    /// Observe the auth state.
    ///
    /// The observer is called once with the loaded state, then once per
    /// change, in registration order.
    pub fn on_auth_state_change<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&AuthSnapshot) + Send + Sync + 'static,
    {
        self.state.register(observer)
    }

    pub async fn begin_popup_sign_in(&self, provider: &dyn AuthProvider) -> Result<Outcome> {
        self.resolver.begin_popup(provider, AuthAction::SignIn).await
    }

    pub async fn link_with_popup(&self, provider: &dyn AuthProvider) -> Result<Outcome> {
        self.resolver.begin_popup(provider, AuthAction::Link).await
    }

    pub async fn reauthenticate_with_popup(&self, provider: &dyn AuthProvider) -> Result<Outcome> {
        self.resolver
            .begin_popup(provider, AuthAction::Reauthenticate)
            .await
    }

    /// Write the redirect marker and request navigation to the provider.
    ///
    /// The outcome is picked up by the next context with
    /// [`Auth::get_pending_redirect_outcome`].
    pub async fn begin_redirect_sign_in(&self, provider: &dyn AuthProvider) -> Result<()> {
        self.resolver.begin_redirect(provider, AuthAction::SignIn).await
    }

    pub async fn link_with_redirect(&self, provider: &dyn AuthProvider) -> Result<()> {
        self.resolver.begin_redirect(provider, AuthAction::Link).await
    }

    pub async fn reauthenticate_with_redirect(&self, provider: &dyn AuthProvider) -> Result<()> {
        self.resolver
            .begin_redirect(provider, AuthAction::Reauthenticate)
            .await
    }

    /// Outcome of the redirect completed at initialization.
    ///
    /// Handed out once; later calls fail with `no-pending-redirect`.
    pub async fn get_pending_redirect_outcome(&self) -> Result<Outcome> {
        self.resolver.take_redirect_outcome().await
    }

    /// Route a message from a provider completion page to the waiting popup.
    pub async fn deliver_completion(&self, message: CompletionMessage) -> bool {
        self.resolver.deliver(message).await
    }

    /// Start verifying `phone_number` for sign-in and send it a code.
    ///
    /// Returns a session in `CODE_SENT`.
    pub async fn begin_verification(&self, phone_number: &str) -> Result<VerificationSessionHandle> {
        self.begin_phone_flow(phone_number, AuthAction::SignIn).await
    }

    /// Like [`Auth::begin_verification`], but the confirmed number is
    /// linked to the current user.
    pub async fn link_with_phone_number(&self, phone_number: &str) -> Result<VerificationSessionHandle> {
        self.begin_phone_flow(phone_number, AuthAction::Link).await
    }

    /// Re-prove the current user's identity with a code sent to
    /// `phone_number`.
    pub async fn reauthenticate_with_phone_number(
        &self,
        phone_number: &str,
    ) -> Result<VerificationSessionHandle> {
        self.begin_phone_flow(phone_number, AuthAction::Reauthenticate)
            .await
    }

    #[instrument(skip(self, phone_number), fields(action = action.as_str()))]
    async fn begin_phone_flow(
        &self,
        phone_number: &str,
        action: AuthAction,
    ) -> Result<VerificationSessionHandle> {
        let mut flow = VerificationFlow::new(phone_number, action, self.verification.clone())?;
        flow.prepare_challenge().await?;
        flow.send_code().await?;
        Ok(VerificationSessionHandle::new(flow))
    }

    pub async fn confirm_verification(
        &self,
        session: &VerificationSessionHandle,
        code: &str,
    ) -> Result<UserCredential> {
        session.confirm(code).await
    }

    /// Rebuild a verification session persisted before a reload.
    pub async fn resume_verification(&self) -> Result<Option<VerificationSessionHandle>> {
        let Some(marker) = self.tracker.peek(OperationKind::Verification).await? else {
            return Ok(None);
        };
        if marker.verification.is_none() {
            warn!("Verification marker without session data ignored");
            return Ok(None);
        }

        let flow = VerificationFlow::resume(marker, self.verification.clone()).await?;
        Ok(Some(VerificationSessionHandle::new(flow)))
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.state.sign_out().await
    }

    /// Backend currently holding the user record.
    pub async fn persistence(&self) -> StorageScope {
        self.user_store.scope().await
    }

    /// Move the user record to `backend` and make it the active backend.
    ///
    /// Pending markers stay where they are.
    #[instrument(skip(self, backend), fields(to = %backend.scope()))]
    pub async fn set_persistence(&self, backend: PersistenceBackend) -> Result<()> {
        let from = self.user_store.scope().await;
        let to = backend.scope();

        self.user_store
            .switch_backend(backend, &self.keys.user())
            .await?;
        self.bus.restart().await;

        let _ = self.events.emit(CoreEvent::Auth(AuthEvent::PersistenceMigrated {
            from: from.to_string(),
            to: to.to_string(),
        }));
        Ok(())
    }

    /// Stop background work and release every subscription.
    pub async fn shutdown(&self) {
        self.resolver.shutdown().await;
        self.state.shutdown();
        self.bus.shutdown();
        info!("Auth shut down");
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("keys", &self.keys)
            .field("state", &self.state.state())
            .finish_non_exhaustive()
    }
}

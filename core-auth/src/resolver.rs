//! # Popup/Redirect Resolver
//!
//! Runs the provider handoff in either of its two shapes and turns the
//! result into exactly one [`Outcome`].
//!
//! ## Popup
//!
//! ```text
//! begin marker -> open window -> wait for the first of:
//!     completion message   => backend handshake => Success | Error
//!     window closed (poll) => Cancelled(popup-closed-by-user)
//! ```
//!
//! Whichever signal takes the active popup out of its slot first wins; the
//! other one finds the slot empty (or holding a newer popup) and is
//! ignored. A new popup settles the previous one with
//! `cancelled-by-new-request` before its own marker is written.
//!
//! ## Redirect
//!
//! The marker is written and navigation is requested from the host. The
//! next resolver built on the same marker store finishes the handshake and
//! keeps the outcome for a single [`PopupRedirectResolver::take_redirect_outcome`].

use crate::backend::{HandoffCompletion, IdentityBackend};
use crate::error::{AuthError, AuthErrorCode, BackendError, Result};
use crate::pending::{MarkerMetadata, PendingOperationTracker};
use crate::provider::{generate_correlation_id, AuthProvider, HandoffContext, HandoffMode};
use crate::state::AuthStateManager;
use crate::types::{AuthAction, OperationKind, Outcome, OutcomeError, UserCredential, UserId};
use bridge_traits::{Navigator, PopupLauncher, PopupRequest, PopupWindow};
use core_runtime::events::{AuthEvent, CoreEvent, EventBus, SettledAs};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Discriminant of a completion message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionStatus {
    Success,
    Error,
}

/// Message relayed from the provider's completion page to the opener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMessage {
    /// Unique per delivery; repeated deliveries carry the same id
    pub event_id: String,
    pub correlation_id: String,
    pub outcome: CompletionStatus,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub api_key: String,
    pub app_name: String,
    pub tenant_id: Option<String>,
    pub popup_poll_interval: Duration,
    pub popup_close_grace: Duration,
}

/// How long completion event ids are remembered.
const EVENT_ID_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Event ids seen in the current window. The whole set is dropped once the
/// window has run out, so memory stays bounded by one window's deliveries.
struct SeenEvents {
    ids: HashSet<String>,
    window_start: Instant,
}

impl SeenEvents {
    fn new() -> Self {
        Self {
            ids: HashSet::new(),
            window_start: Instant::now(),
        }
    }

    /// Returns `false` when `event_id` was already seen in this window.
    fn insert(&mut self, event_id: &str) -> bool {
        if self.window_start.elapsed() >= EVENT_ID_WINDOW {
            debug!(forgotten = self.ids.len(), "Completion event id window expired");
            self.ids.clear();
            self.window_start = Instant::now();
        }
        self.ids.insert(event_id.to_string())
    }
}

struct ActivePopup {
    correlation_id: String,
    provider_id: String,
    action: AuthAction,
    expected_uid: Option<UserId>,
    settle: oneshot::Sender<Outcome>,
    window: Box<dyn PopupWindow>,
}

pub struct PopupRedirectResolver {
    tracker: Arc<PendingOperationTracker>,
    state: Arc<AuthStateManager>,
    backend: Arc<dyn IdentityBackend>,
    launcher: Arc<dyn PopupLauncher>,
    navigator: Arc<dyn Navigator>,
    events: EventBus,
    settings: ResolverSettings,
    active: Mutex<Option<ActivePopup>>,
    processed_events: Mutex<SeenEvents>,
    redirect_outcome: Mutex<Option<Outcome>>,
}

impl PopupRedirectResolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tracker: Arc<PendingOperationTracker>,
        state: Arc<AuthStateManager>,
        backend: Arc<dyn IdentityBackend>,
        launcher: Arc<dyn PopupLauncher>,
        navigator: Arc<dyn Navigator>,
        events: EventBus,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            tracker,
            state,
            backend,
            launcher,
            navigator,
            events,
            settings,
            active: Mutex::new(None),
            processed_events: Mutex::new(SeenEvents::new()),
            redirect_outcome: Mutex::new(None),
        }
    }

    /// Run a popup handoff to completion.
    ///
    /// Only argument and storage failures are returned as `Err`; every flow
    /// failure is an [`Outcome`].
    #[instrument(skip(self, provider), fields(provider = %provider.provider_id(), action = action.as_str()))]
    pub async fn begin_popup(&self, provider: &dyn AuthProvider, action: AuthAction) -> Result<Outcome> {
        let expected_uid = self.expected_uid(action)?;
        let correlation_id = generate_correlation_id();
        let url = provider.handoff_url(&self.context(&correlation_id, HandoffMode::Popup, action))?;

        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            info!(previous = %previous.correlation_id, "Cancelling pending popup for new request");
            previous.window.close();
            self.settle_popup(previous, Outcome::failed(&AuthError::CancelledByNewRequest));
        }

        self.tracker
            .begin(
                OperationKind::Popup,
                &correlation_id,
                self.metadata(provider, action, expected_uid.clone()),
            )
            .await?;

        let request = PopupRequest::new(url, format!("identity-popup-{}", correlation_id));
        let window = match self.launcher.open(request).await {
            Ok(Some(window)) => window,
            Ok(None) => return Ok(self.popup_blocked(&correlation_id, None).await),
            Err(e) => return Ok(self.popup_blocked(&correlation_id, Some(e.to_string())).await),
        };

        let (settle, settled) = oneshot::channel();
        let popup = ActivePopup {
            correlation_id: correlation_id.clone(),
            provider_id: provider.provider_id().to_string(),
            action,
            expected_uid,
            settle,
            window,
        };
        let displaced = self.active.lock().await.replace(popup);
        if let Some(displaced) = displaced {
            displaced.window.close();
            self.settle_popup(displaced, Outcome::failed(&AuthError::CancelledByNewRequest));
        }

        let _ = self.events.emit(CoreEvent::Auth(AuthEvent::PopupOpened {
            correlation_id: correlation_id.clone(),
            provider_id: provider.provider_id().to_string(),
        }));
        debug!(correlation_id = %correlation_id, "Popup opened");

        Ok(self.wait_for_popup(&correlation_id, settled).await)
    }

    /// Deliver a message from a provider completion page.
    ///
    /// Returns `false` when the message was ignored (duplicate delivery or
    /// no matching popup).
    #[instrument(skip(self, message), fields(correlation_id = %message.correlation_id, event_id = %message.event_id))]
    pub async fn deliver(&self, message: CompletionMessage) -> bool {
        if !self.processed_events.lock().await.insert(&message.event_id) {
            debug!("Duplicate completion message ignored");
            return false;
        }

        let Some(popup) = self.take_active(&message.correlation_id).await else {
            debug!("No popup waiting for this correlation id");
            return false;
        };

        self.release_marker(&popup.correlation_id).await;
        popup.window.close();

        let outcome = match message.outcome {
            CompletionStatus::Success => {
                let completion = HandoffCompletion {
                    correlation_id: popup.correlation_id.clone(),
                    provider_id: popup.provider_id.clone(),
                    action: popup.action,
                    mode: HandoffMode::Popup,
                    tenant_id: self.settings.tenant_id.clone(),
                    payload: message.payload,
                    current_user: self.state.current_user(),
                };
                self.complete(completion, popup.expected_uid.as_ref()).await
            }
            CompletionStatus::Error => {
                let reason = message
                    .payload
                    .get("error")
                    .and_then(|error| error.as_str())
                    .unwrap_or("provider reported an error")
                    .to_string();
                warn!(reason = %reason, "Provider reported a failed handoff");
                Outcome::failed(&AuthError::BackendUnreachable(reason))
            }
        };

        self.settle_popup(popup, outcome);
        true
    }

    /// Write the redirect marker and ask the host to navigate away.
    #[instrument(skip(self, provider), fields(provider = %provider.provider_id(), action = action.as_str()))]
    pub async fn begin_redirect(&self, provider: &dyn AuthProvider, action: AuthAction) -> Result<()> {
        let expected_uid = self.expected_uid(action)?;
        let correlation_id = generate_correlation_id();
        let url = provider.handoff_url(&self.context(&correlation_id, HandoffMode::Redirect, action))?;

        self.tracker
            .begin(
                OperationKind::Redirect,
                &correlation_id,
                self.metadata(provider, action, expected_uid),
            )
            .await?;

        let _ = self.events.emit(CoreEvent::Auth(AuthEvent::RedirectRequested {
            correlation_id: correlation_id.clone(),
            provider_id: provider.provider_id().to_string(),
        }));

        if let Err(e) = self.navigator.request_navigation(&url).await {
            warn!(error = %e, "Navigation request failed, dropping redirect marker");
            if let Err(discard) = self.tracker.discard(OperationKind::Redirect).await {
                warn!(error = %discard, "Failed to drop redirect marker");
            }
            return Err(AuthError::Internal(format!("navigation request failed: {}", e)));
        }

        info!(correlation_id = %correlation_id, "Redirect requested");
        Ok(())
    }

    /// Finish a redirect that began before this context was (re)built.
    ///
    /// Does nothing when no redirect marker is stored.
    #[instrument(skip(self))]
    pub async fn resume_pending_redirect(&self) {
        if let Err(e) = self.state.wait_until_resolved().await {
            warn!(error = %e, "Auth state unavailable, pending redirect left in place");
            return;
        }

        let marker = match self.tracker.consume(OperationKind::Redirect).await {
            Ok(Some(marker)) => marker,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read pending redirect");
                return;
            }
        };
        info!(correlation_id = %marker.correlation_id, "Resuming pending redirect");

        let completion = HandoffCompletion {
            correlation_id: marker.correlation_id.clone(),
            provider_id: marker.provider_id.clone(),
            action: marker.action,
            mode: HandoffMode::Redirect,
            tenant_id: marker.tenant_id.clone(),
            payload: serde_json::Value::Null,
            current_user: self.state.current_user(),
        };
        let outcome = self.complete(completion, marker.user_uid.as_ref()).await;

        let (settled_as, code) = settled_as(&outcome);
        let _ = self.events.emit(CoreEvent::Auth(AuthEvent::RedirectResolved {
            correlation_id: marker.correlation_id,
            settled_as,
            code,
        }));

        *self.redirect_outcome.lock().await = Some(outcome);
    }

    /// Outcome of the redirect resumed by this context, handed out once.
    pub async fn take_redirect_outcome(&self) -> Result<Outcome> {
        self.redirect_outcome
            .lock()
            .await
            .take()
            .ok_or(AuthError::NoPendingRedirect)
    }

    /// Abandon any open popup.
    pub async fn shutdown(&self) {
        if let Some(popup) = self.active.lock().await.take() {
            popup.window.close();
            self.release_marker(&popup.correlation_id).await;
            self.settle_popup(popup, Outcome::failed(&AuthError::Internal("auth instance shut down".to_string())));
        }
    }

    async fn wait_for_popup(&self, correlation_id: &str, mut settled: oneshot::Receiver<Outcome>) -> Outcome {
        let period = self.settings.popup_poll_interval;
        let grace = self.settings.popup_close_grace;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                outcome = &mut settled => return outcome.unwrap_or_else(|_| abandoned()),
                _ = ticker.tick() => {
                    if !self.window_closed(correlation_id).await {
                        continue;
                    }

                    if !grace.is_zero() {
                        debug!(grace_ms = grace.as_millis() as u64, "Popup closed, waiting for a late message");
                        if let Ok(outcome) = timeout(grace, &mut settled).await {
                            return outcome.unwrap_or_else(|_| abandoned());
                        }
                    }

                    if let Some(popup) = self.take_active(correlation_id).await {
                        info!(correlation_id, "Popup closed by user");
                        self.release_marker(correlation_id).await;
                        self.settle_popup(popup, Outcome::Cancelled { code: AuthErrorCode::PopupClosedByUser });
                    }
                }
            }
        }
    }

    async fn complete(&self, completion: HandoffCompletion, expected_uid: Option<&UserId>) -> Outcome {
        let action = completion.action;
        let sign_in = match self.backend.complete_handoff(completion).await {
            Ok(sign_in) => sign_in,
            Err(e) => {
                let partial_credential = match &e {
                    BackendError::Rejected { partial_credential, .. } => partial_credential.clone(),
                    _ => None,
                };
                let err = AuthError::from(e);
                warn!(error = %err, "Handoff completion failed");
                return Outcome::Error(OutcomeError {
                    partial_credential,
                    ..OutcomeError::from(&err)
                });
            }
        };

        if let Some(expected) = expected_uid {
            if &sign_in.user.uid != expected {
                warn!(expected = %expected, returned = %sign_in.user.uid, "Handoff returned a different user");
                return Outcome::Error(OutcomeError {
                    partial_credential: sign_in.credential,
                    ..OutcomeError::from(&AuthError::UserMismatch)
                });
            }
        }

        match self.state.install(sign_in.user).await {
            Ok(user) => Outcome::Success(UserCredential {
                user,
                credential: sign_in.credential,
                action,
                is_new_user: sign_in.is_new_user,
            }),
            Err(e) => {
                warn!(error = %e, "Failed to install user");
                Outcome::failed(&e)
            }
        }
    }

    fn expected_uid(&self, action: AuthAction) -> Result<Option<UserId>> {
        if !action.requires_current_user() {
            return Ok(None);
        }
        self.state
            .current_user()
            .map(|user| Some(user.uid.clone()))
            .ok_or(AuthError::NoCurrentUser)
    }

    fn context(&self, correlation_id: &str, mode: HandoffMode, action: AuthAction) -> HandoffContext {
        HandoffContext {
            correlation_id: correlation_id.to_string(),
            mode,
            action,
            api_key: self.settings.api_key.clone(),
            app_name: self.settings.app_name.clone(),
            tenant_id: self.settings.tenant_id.clone(),
        }
    }

    fn metadata(&self, provider: &dyn AuthProvider, action: AuthAction, user_uid: Option<UserId>) -> MarkerMetadata {
        MarkerMetadata {
            provider_id: provider.provider_id().to_string(),
            tenant_id: self.settings.tenant_id.clone(),
            action,
            user_uid,
            verification: None,
        }
    }

    async fn popup_blocked(&self, correlation_id: &str, reason: Option<String>) -> Outcome {
        match reason {
            Some(reason) => warn!(error = %reason, "Popup launcher failed"),
            None => warn!("Popup blocked"),
        }
        self.release_marker(correlation_id).await;

        let outcome = Outcome::failed(&AuthError::PopupBlocked);
        self.emit_settled(correlation_id, &outcome);
        outcome
    }

    async fn take_active(&self, correlation_id: &str) -> Option<ActivePopup> {
        let mut active = self.active.lock().await;
        if active
            .as_ref()
            .is_some_and(|popup| popup.correlation_id == correlation_id)
        {
            active.take()
        } else {
            None
        }
    }

    async fn window_closed(&self, correlation_id: &str) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|popup| popup.correlation_id == correlation_id && popup.window.is_closed())
    }

    async fn release_marker(&self, correlation_id: &str) {
        if let Err(e) = self.tracker.consume_if(OperationKind::Popup, correlation_id).await {
            warn!(correlation_id, error = %e, "Failed to remove popup marker");
        }
    }

    fn settle_popup(&self, popup: ActivePopup, outcome: Outcome) {
        self.emit_settled(&popup.correlation_id, &outcome);
        // The waiter may already be gone (caller dropped the future).
        let _ = popup.settle.send(outcome);
    }

    fn emit_settled(&self, correlation_id: &str, outcome: &Outcome) {
        let (settled_as, code) = settled_as(outcome);
        let _ = self.events.emit(CoreEvent::Auth(AuthEvent::PopupSettled {
            correlation_id: correlation_id.to_string(),
            settled_as,
            code,
        }));
    }
}

fn settled_as(outcome: &Outcome) -> (SettledAs, Option<String>) {
    let settled_as = match outcome {
        Outcome::Success(_) => SettledAs::Success,
        Outcome::Error(_) => SettledAs::Error,
        Outcome::Cancelled { .. } => SettledAs::Cancelled,
    };
    (settled_as, outcome.code().map(|code| code.as_str().to_string()))
}

fn abandoned() -> Outcome {
    Outcome::failed(&AuthError::Internal("popup operation abandoned".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_message_wire_shape() {
        let message: CompletionMessage = serde_json::from_value(serde_json::json!({
            "eventId": "evt-1",
            "correlationId": "cid-1",
            "outcome": "success",
            "payload": {"code": "4/0Ab"}
        }))
        .unwrap();

        assert_eq!(message.event_id, "evt-1");
        assert_eq!(message.outcome, CompletionStatus::Success);
        assert_eq!(message.payload["code"], "4/0Ab");
    }

    #[test]
    fn test_completion_message_payload_is_optional() {
        let message: CompletionMessage = serde_json::from_value(serde_json::json!({
            "eventId": "evt-1",
            "correlationId": "cid-1",
            "outcome": "error"
        }))
        .unwrap();
        assert!(message.payload.is_null());
    }

    #[tokio::test(start_paused = true)]
    async fn test_seen_events_forget_after_window() {
        let mut seen = SeenEvents::new();
        assert!(seen.insert("evt-1"));
        assert!(!seen.insert("evt-1"));

        tokio::time::advance(EVENT_ID_WINDOW - Duration::from_secs(1)).await;
        assert!(!seen.insert("evt-1"));
        assert!(seen.insert("evt-2"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(seen.insert("evt-1"));
        assert_eq!(seen.ids.len(), 1);
    }

    #[test]
    fn test_settled_as_codes() {
        let (settled, code) = settled_as(&Outcome::Cancelled {
            code: AuthErrorCode::PopupClosedByUser,
        });
        assert_eq!(settled, SettledAs::Cancelled);
        assert_eq!(code.as_deref(), Some("popup-closed-by-user"));

        let (settled, code) = settled_as(&Outcome::failed(&AuthError::PopupBlocked));
        assert_eq!(settled, SettledAs::Error);
        assert_eq!(code.as_deref(), Some("popup-blocked"));
    }
}

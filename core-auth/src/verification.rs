//! # Verification Flow
//!
//! Out-of-band verification of a phone number.
//!
//! ```text
//! Init -> ChallengeReady -> CodeSent -> Verified
//!   \___________\______________\______> Failed
//! ```
//!
//! - The challenge token is single use: it is given up on submission
//!   whatever the result, and a retried send has to go back through `Init`.
//! - A wrong code keeps the flow in `CodeSent`; how many retries to allow
//!   is up to the caller.
//! - Any other backend failure is terminal.
//!
//! Reaching `CodeSent` writes a `verification` marker holding the
//! verification id, so a reloaded context can rebuild the session with
//! [`VerificationFlow::resume`].
//!
//! A flow signs in, links the number to the current user, or
//! re-authenticates the current user. The last two remember who was
//! signed in when the flow began and refuse a confirmed user with another
//! uid.

use crate::backend::{ChallengeToken, ChallengeVerifier, CodeConfirmation, IdentityBackend};
use crate::error::{AuthError, BackendError, Result};
use crate::pending::{MarkerMetadata, PendingMarker, PendingOperationTracker, PendingTicket, VerificationMarker};
use crate::state::AuthStateManager;
use crate::types::{AuthAction, OperationKind, UserCredential, UserId};
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use core_runtime::logging::redact_if_sensitive;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Provider id recorded for phone verification.
pub const PHONE_PROVIDER_ID: &str = "phone";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationState {
    Init,
    ChallengeReady,
    CodeSent,
    Verified,
    Failed,
}

impl VerificationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, VerificationState::Verified | VerificationState::Failed)
    }
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VerificationState::Init => "INIT",
            VerificationState::ChallengeReady => "CHALLENGE_READY",
            VerificationState::CodeSent => "CODE_SENT",
            VerificationState::Verified => "VERIFIED",
            VerificationState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Collaborators a verification flow talks to.
#[derive(Clone)]
pub struct VerificationServices {
    pub backend: Arc<dyn IdentityBackend>,
    pub verifier: Arc<dyn ChallengeVerifier>,
    pub tracker: Arc<PendingOperationTracker>,
    pub state: Arc<AuthStateManager>,
    pub events: EventBus,
}

pub struct VerificationFlow {
    target: String,
    action: AuthAction,
    /// Current user when a link or re-authentication began
    expected_uid: Option<UserId>,
    state: VerificationState,
    challenge: Option<ChallengeToken>,
    verification_id: Option<String>,
    ticket: Option<PendingTicket>,
    services: VerificationServices,
}

impl VerificationFlow {
    /// Start a flow for `target`, an E.164 phone number.
    ///
    /// Link and re-authentication fail with `no-current-user` when nobody
    /// is signed in.
    pub fn new(
        target: impl Into<String>,
        action: AuthAction,
        services: VerificationServices,
    ) -> Result<Self> {
        let target = target.into();
        validate_phone_number(&target)?;

        let expected_uid = if action.requires_current_user() {
            let user = services.state.current_user().ok_or(AuthError::NoCurrentUser)?;
            Some(user.uid.clone())
        } else {
            None
        };

        Ok(Self {
            target,
            action,
            expected_uid,
            state: VerificationState::Init,
            challenge: None,
            verification_id: None,
            ticket: None,
            services,
        })
    }

    /// Rebuild a `CodeSent` flow from a marker that survived a reload.
    pub async fn resume(marker: PendingMarker, services: VerificationServices) -> Result<Self> {
        let verification = marker.verification.ok_or_else(|| {
            AuthError::InvalidArgument("marker carries no verification session".to_string())
        })?;
        let ticket = services
            .tracker
            .adopt(OperationKind::Verification, &verification.verification_id)
            .await;

        info!(
            phone = %redact_if_sensitive("phone_number", &verification.target),
            action = marker.action.as_str(),
            "Resumed verification session"
        );
        Ok(Self {
            target: verification.target,
            action: marker.action,
            expected_uid: marker.user_uid,
            state: VerificationState::CodeSent,
            challenge: None,
            verification_id: Some(verification.verification_id),
            ticket: Some(ticket),
            services,
        })
    }

    pub fn state(&self) -> VerificationState {
        self.state
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn action(&self) -> AuthAction {
        self.action
    }

    pub fn verification_id(&self) -> Option<&str> {
        self.verification_id.as_deref()
    }

    /// `Init -> ChallengeReady`
    #[instrument(skip(self), fields(state = %self.state))]
    pub async fn prepare_challenge(&mut self) -> Result<()> {
        self.ensure_state(VerificationState::Init, "challenge can only be prepared from INIT")?;

        match self.services.verifier.obtain_token().await {
            Ok(token) => {
                self.challenge = Some(token);
                self.state = VerificationState::ChallengeReady;
                debug!("Challenge token ready");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Challenge verifier failed");
                Err(self.fail(e.into()))
            }
        }
    }

    /// `ChallengeReady -> CodeSent`; returns the verification id.
    #[instrument(skip(self), fields(state = %self.state))]
    pub async fn send_code(&mut self) -> Result<String> {
        let token = match self.state {
            VerificationState::ChallengeReady => self.challenge.take(),
            VerificationState::Init | VerificationState::CodeSent => None,
            VerificationState::Verified | VerificationState::Failed => {
                return Err(finished(self.state));
            }
        };
        let Some(token) = token else {
            warn!("No unused challenge token, a fresh challenge is required");
            return Err(AuthError::VerificationChallengeExpired);
        };

        let sent = self
            .services
            .backend
            .send_verification_code(&self.target, token)
            .await;
        self.services.verifier.reset();

        match sent {
            Ok(verification_id) => {
                self.code_sent(&verification_id).await;
                Ok(verification_id)
            }
            Err(BackendError::ChallengeExpired) => {
                warn!("Backend rejected the challenge token, back to INIT");
                self.state = VerificationState::Init;
                Err(AuthError::VerificationChallengeExpired)
            }
            Err(e) => {
                warn!(error = %e, "Sending verification code failed");
                Err(self.fail(e.into()))
            }
        }
    }

    /// `CodeSent -> Verified`, installing the verified user.
    #[instrument(skip(self, code), fields(state = %self.state))]
    pub async fn confirm(&mut self, code: &str) -> Result<UserCredential> {
        validate_code(code)?;
        if self.state.is_terminal() {
            return Err(finished(self.state));
        }
        self.ensure_state(VerificationState::CodeSent, "no verification code has been sent")?;

        if self.ticket.as_mut().is_some_and(|ticket| ticket.is_superseded()) {
            info!("Verification session superseded by a newer one");
            self.state = VerificationState::Failed;
            self.ticket = None;
            return Err(AuthError::Superseded);
        }

        let Some(verification_id) = self.verification_id.clone() else {
            return Err(self.fail(AuthError::Internal("missing verification id".to_string())));
        };

        let current_user = if self.action.requires_current_user() {
            match self.services.state.current_user() {
                Some(user) => Some(user),
                None => {
                    let err = self.fail(AuthError::NoCurrentUser);
                    self.finish(&verification_id, Some(err.code().as_str())).await;
                    return Err(err);
                }
            }
        } else {
            None
        };

        let confirmation = CodeConfirmation {
            verification_id: verification_id.clone(),
            code: code.to_string(),
            action: self.action,
            current_user,
        };
        let sign_in = match self
            .services
            .backend
            .confirm_verification_code(confirmation)
            .await
        {
            Ok(sign_in) => sign_in,
            Err(BackendError::CodeMismatch) => {
                debug!("Verification code mismatch, still CODE_SENT");
                return Err(AuthError::VerificationCodeMismatch);
            }
            Err(e) => {
                warn!(error = %e, "Verification code confirmation failed");
                let err = self.fail(e.into());
                self.finish(&verification_id, Some(err.code().as_str())).await;
                return Err(err);
            }
        };

        if let Some(expected) = &self.expected_uid {
            if &sign_in.user.uid != expected {
                warn!(expected = %expected, returned = %sign_in.user.uid, "Verification confirmed a different user");
                let err = self.fail(AuthError::UserMismatch);
                self.finish(&verification_id, Some(err.code().as_str())).await;
                return Err(err);
            }
        }

        match self.services.state.install(sign_in.user).await {
            Ok(user) => {
                self.state = VerificationState::Verified;
                self.finish(&verification_id, None).await;
                info!(uid = %user.uid, "Verification completed");
                Ok(UserCredential {
                    user,
                    credential: sign_in.credential,
                    action: self.action,
                    is_new_user: sign_in.is_new_user,
                })
            }
            Err(e) => {
                let err = self.fail(e);
                self.finish(&verification_id, Some(err.code().as_str())).await;
                Err(err)
            }
        }
    }

    /// Back to `Init` from any state, discarding the session.
    pub async fn reset(&mut self) {
        self.challenge = None;
        self.services.verifier.reset();
        if let Some(verification_id) = self.verification_id.take() {
            self.release_marker(&verification_id).await;
        }
        self.ticket = None;
        self.state = VerificationState::Init;
        debug!("Verification flow reset");
    }

    async fn code_sent(&mut self, verification_id: &str) {
        self.verification_id = Some(verification_id.to_string());
        self.state = VerificationState::CodeSent;

        let metadata = MarkerMetadata {
            action: self.action,
            user_uid: self.expected_uid.clone(),
            verification: Some(VerificationMarker {
                verification_id: verification_id.to_string(),
                target: self.target.clone(),
            }),
            ..MarkerMetadata::new(PHONE_PROVIDER_ID)
        };
        match self
            .services
            .tracker
            .begin(OperationKind::Verification, verification_id, metadata)
            .await
        {
            Ok(ticket) => self.ticket = Some(ticket),
            Err(e) => warn!(error = %e, "Failed to persist verification session, it will not survive a reload"),
        }

        info!(
            phone = %redact_if_sensitive("phone_number", &self.target),
            "Verification code sent"
        );
        let _ = self
            .services
            .events
            .emit(CoreEvent::Auth(AuthEvent::VerificationCodeSent {
                verification_id: verification_id.to_string(),
            }));
    }

    async fn finish(&mut self, verification_id: &str, code: Option<&str>) {
        self.release_marker(verification_id).await;
        self.ticket = None;
        let _ = self
            .services
            .events
            .emit(CoreEvent::Auth(AuthEvent::VerificationCompleted {
                verification_id: verification_id.to_string(),
                code: code.map(str::to_string),
            }));
    }

    async fn release_marker(&self, verification_id: &str) {
        if let Err(e) = self
            .services
            .tracker
            .consume_if(OperationKind::Verification, verification_id)
            .await
        {
            warn!(error = %e, "Failed to remove verification marker");
        }
    }

    fn ensure_state(&self, expected: VerificationState, message: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(AuthError::InvalidArgument(format!(
                "{} (state is {})",
                message, self.state
            )))
        }
    }

    fn fail(&mut self, err: AuthError) -> AuthError {
        self.state = VerificationState::Failed;
        self.challenge = None;
        err
    }
}

fn finished(state: VerificationState) -> AuthError {
    AuthError::InvalidArgument(format!("verification session already finished ({})", state))
}

/// `+` followed by 8 to 15 digits.
pub fn validate_phone_number(target: &str) -> Result<()> {
    let digits = target.strip_prefix('+').unwrap_or("");
    if (8..=15).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(AuthError::InvalidArgument(
            "phone number must be in E.164 format".to_string(),
        ))
    }
}

fn validate_code(code: &str) -> Result<()> {
    if !code.is_empty() && code.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(AuthError::InvalidArgument(
            "verification code must be digits".to_string(),
        ))
    }
}

/// Shareable handle to one verification session.
#[derive(Clone)]
pub struct VerificationSessionHandle {
    flow: Arc<Mutex<VerificationFlow>>,
}

impl VerificationSessionHandle {
    pub fn new(flow: VerificationFlow) -> Self {
        Self {
            flow: Arc::new(Mutex::new(flow)),
        }
    }

    pub async fn state(&self) -> VerificationState {
        self.flow.lock().await.state()
    }

    pub async fn verification_id(&self) -> Option<String> {
        self.flow.lock().await.verification_id().map(str::to_string)
    }

    pub async fn action(&self) -> AuthAction {
        self.flow.lock().await.action()
    }

    pub async fn prepare_challenge(&self) -> Result<()> {
        self.flow.lock().await.prepare_challenge().await
    }

    pub async fn send_code(&self) -> Result<String> {
        self.flow.lock().await.send_code().await
    }

    pub async fn confirm(&self, code: &str) -> Result<UserCredential> {
        self.flow.lock().await.confirm(code).await
    }

    pub async fn reset(&self) {
        self.flow.lock().await.reset().await
    }
}

impl fmt::Debug for VerificationSessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationSessionHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phone_number_validation() {
        assert!(validate_phone_number("+15551234567").is_ok());
        assert!(validate_phone_number("+4412345678").is_ok());

        for invalid in ["15551234567", "+1555", "+1555123456789012", "+1555-123-4567", ""] {
            assert!(matches!(
                validate_phone_number(invalid),
                Err(AuthError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_code_validation() {
        assert!(validate_code("123456").is_ok());
        assert!(validate_code("").is_err());
        assert!(validate_code("12a456").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(VerificationState::Verified.is_terminal());
        assert!(VerificationState::Failed.is_terminal());
        assert!(!VerificationState::CodeSent.is_terminal());
        assert_eq!(VerificationState::ChallengeReady.to_string(), "CHALLENGE_READY");
    }
}

//! External collaborators: the identity backend and the challenge verifier.
//!
//! Wire formats live behind these traits. The core only needs the result
//! of a completed handoff and the verification round-trips.

use crate::error::BackendError;
use crate::provider::HandoffMode;
use crate::types::{AuthAction, AuthCredential, UserRecord};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Everything the backend needs to finish a popup or redirect handoff.
#[derive(Debug, Clone)]
pub struct HandoffCompletion {
    pub correlation_id: String,
    pub provider_id: String,
    pub action: AuthAction,
    pub mode: HandoffMode,
    pub tenant_id: Option<String>,
    /// Result payload relayed by the provider's completion page
    pub payload: serde_json::Value,
    /// Signed-in user for link and re-authentication
    pub current_user: Option<Arc<UserRecord>>,
}

/// A user returned by the backend.
#[derive(Debug, Clone)]
pub struct BackendSignIn {
    pub user: UserRecord,
    pub credential: Option<AuthCredential>,
    pub is_new_user: bool,
}

#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Exchange a handoff result for a user.
    async fn complete_handoff(
        &self,
        completion: HandoffCompletion,
    ) -> Result<BackendSignIn, BackendError>;

    /// Send a verification code to `target`.
    ///
    /// Returns the opaque verification id.
    async fn send_verification_code(
        &self,
        target: &str,
        challenge: ChallengeToken,
    ) -> Result<String, BackendError>;

    async fn confirm_verification_code(
        &self,
        confirmation: CodeConfirmation,
    ) -> Result<BackendSignIn, BackendError>;
}

/// A code submitted for a sent verification.
#[derive(Clone)]
pub struct CodeConfirmation {
    pub verification_id: String,
    pub code: String,
    pub action: AuthAction,
    /// Signed-in user for link and re-authentication
    pub current_user: Option<Arc<UserRecord>>,
}

impl fmt::Debug for CodeConfirmation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeConfirmation")
            .field("verification_id", &self.verification_id)
            .field("code", &"[REDACTED]")
            .field("action", &self.action)
            .field("current_user", &self.current_user.as_ref().map(|user| &user.uid))
            .finish()
    }
}

/// Single-use proof that a challenge (e.g. a CAPTCHA) was solved.
///
/// Consumed by value when submitted and never copied, so a token cannot be
/// submitted twice. `Debug` is redacted.
///
/// ```compile_fail
/// let token = core_auth::ChallengeToken::new("03AGdBq24");
/// let _copy = token.clone();
/// ```
#[derive(PartialEq, Eq)]
pub struct ChallengeToken(String);

impl ChallengeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ChallengeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChallengeToken([REDACTED])")
    }
}

/// Obtains challenge tokens (renders the widget, runs the invisible check).
#[async_trait]
pub trait ChallengeVerifier: Send + Sync {
    async fn obtain_token(&self) -> Result<ChallengeToken, BackendError>;

    /// Discard any solved challenge so the next token is fresh.
    fn reset(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_token_debug_is_redacted() {
        let token = ChallengeToken::new("03AGdBq24...");
        assert_eq!(format!("{:?}", token), "ChallengeToken([REDACTED])");
        assert_eq!(token.as_str(), "03AGdBq24...");
    }
}

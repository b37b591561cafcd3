use crate::error::{AuthError, AuthErrorCode};
use chrono::{DateTime, Utc};
use core_runtime::logging::redact_if_sensitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Backend-issued unique identifier of a user.
///
/// # Examples
///
/// ```
/// use core_auth::UserId;
///
/// let uid = UserId::new("u-123");
/// assert_eq!(uid.as_str(), "u-123");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Link between a user and one external identity provider account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLink {
    /// Provider identifier (e.g. "google.com", "phone")
    pub provider_id: String,
    /// Subject identifier of the account at that provider
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl ProviderLink {
    pub fn new(provider_id: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            subject_id: subject_id.into(),
            email: None,
            display_name: None,
        }
    }
}

/// Session credential material of a signed-in user.
///
/// # Security
///
/// The `Debug` implementation redacts both tokens.
///
/// # Examples
///
/// ```
/// use core_auth::SessionCredential;
/// use chrono::{Duration, Utc};
///
/// let credential = SessionCredential {
///     access_token: "eyJhbGciOi...".to_string(),
///     refresh_token: Some("AMf-vBx...".to_string()),
///     expires_at: Utc::now() + Duration::hours(1),
/// };
///
/// assert!(!credential.is_expired());
/// assert!(!format!("{:?}", credential).contains("eyJ"));
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredential {
    /// Opaque token blob presented to the backend
    pub access_token: String,
    /// Handle used to mint a fresh access token
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl SessionCredential {
    /// Whether the access token is expired or expires within five minutes.
    pub fn is_expired(&self) -> bool {
        self.is_expired_with_buffer(300)
    }

    pub fn is_expired_with_buffer(&self, buffer_seconds: i64) -> bool {
        Utc::now() >= self.expires_at - chrono::Duration::seconds(buffer_seconds)
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    pub created_at: DateTime<Utc>,
    pub last_sign_in_at: DateTime<Utc>,
}

/// The canonical signed-in user.
///
/// Records are immutable snapshots: the state manager replaces the whole
/// record and hands out `Arc<UserRecord>`, so readers never observe a
/// partially updated user.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub uid: UserId,
    #[serde(default)]
    pub provider_links: Vec<ProviderLink>,
    pub credential: SessionCredential,
    pub metadata: UserMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

impl UserRecord {
    pub fn is_linked_to(&self, provider_id: &str) -> bool {
        self.provider_links
            .iter()
            .any(|link| link.provider_id == provider_id)
    }
}

impl fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRecord")
            .field("uid", &self.uid)
            .field(
                "providers",
                &self
                    .provider_links
                    .iter()
                    .map(|link| link.provider_id.as_str())
                    .collect::<Vec<_>>(),
            )
            .field("credential", &self.credential)
            .field("metadata", &self.metadata)
            .field(
                "phone_number",
                &self
                    .phone_number
                    .as_deref()
                    .map(|phone| redact_if_sensitive("phone_number", phone)),
            )
            .finish()
    }
}

/// Lifecycle of the auth state manager.
///
/// ```text
/// Uninitialized -> Loading -> Authenticated <-> Unauthenticated
///                        \-> Unauthenticated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Uninitialized,
    Loading,
    Authenticated,
    Unauthenticated,
}

impl AuthState {
    /// Whether the initial read from storage has completed.
    pub fn is_resolved(&self) -> bool {
        matches!(self, AuthState::Authenticated | AuthState::Unauthenticated)
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthState::Uninitialized => write!(f, "Uninitialized"),
            AuthState::Loading => write!(f, "Loading..."),
            AuthState::Authenticated => write!(f, "Authenticated"),
            AuthState::Unauthenticated => write!(f, "Unauthenticated"),
        }
    }
}

/// Kind of an in-flight operation tracked across the execution-context boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Popup,
    Redirect,
    Verification,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Popup => "popup",
            OperationKind::Redirect => "redirect",
            OperationKind::Verification => "verification",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a completed handoff does with the returned user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthAction {
    /// Sign in (or up) as the returned user
    #[default]
    SignIn,
    /// Attach the provider account to the current user
    Link,
    /// Re-prove the identity of the current user
    Reauthenticate,
}

impl AuthAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthAction::SignIn => "sign-in",
            AuthAction::Link => "link",
            AuthAction::Reauthenticate => "reauthenticate",
        }
    }

    /// Whether the action operates on an already signed-in user.
    pub fn requires_current_user(&self) -> bool {
        matches!(self, AuthAction::Link | AuthAction::Reauthenticate)
    }
}

/// Provider-issued credential returned alongside a user.
///
/// # Security
///
/// Token fields are redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCredential {
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCredential")
            .field("provider_id", &self.provider_id)
            .field("id_token", &self.id_token.as_ref().map(|_| "[REDACTED]"))
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Successful result of a sign-in, link, re-authentication or verification.
#[derive(Debug, Clone)]
pub struct UserCredential {
    /// The user now installed as current
    pub user: Arc<UserRecord>,
    pub credential: Option<AuthCredential>,
    pub action: AuthAction,
    pub is_new_user: bool,
}

/// Failure details carried by [`Outcome::Error`].
#[derive(Debug, Clone)]
pub struct OutcomeError {
    pub code: AuthErrorCode,
    pub message: String,
    pub partial_credential: Option<AuthCredential>,
}

impl From<&AuthError> for OutcomeError {
    fn from(err: &AuthError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            partial_credential: None,
        }
    }
}

/// The exclusive result of a popup, redirect or verification operation.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(UserCredential),
    Error(OutcomeError),
    Cancelled { code: AuthErrorCode },
}

impl Outcome {
    pub fn failed(err: &AuthError) -> Self {
        Outcome::Error(OutcomeError::from(err))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Error or cancellation code, `None` on success.
    pub fn code(&self) -> Option<AuthErrorCode> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Error(err) => Some(err.code),
            Outcome::Cancelled { code } => Some(*code),
        }
    }

    pub fn user(&self) -> Option<&Arc<UserRecord>> {
        match self {
            Outcome::Success(credential) => Some(&credential.user),
            _ => None,
        }
    }
}

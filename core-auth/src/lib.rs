//! # Identity Session Core
//!
//! Client-side session and identity-state core: keeps the signed-in user
//! consistent across execution contexts that share a storage origin, and
//! runs the multi-step sign-in flows that hand control to an external
//! identity provider.
//!
//! ## Components
//!
//! - [`persistence`] - the active storage backend, availability probing and
//!   backend migration
//! - [`change_bus`] - cross-context change notifications with self-change
//!   filtering
//! - [`state`] - the auth state machine and its observers
//! - [`pending`] - durable markers for operations that span a context
//!   boundary
//! - [`resolver`] - popup and redirect handoffs
//! - [`verification`] - phone verification state machine
//! - [`auth`] - the [`Auth`] context tying them together
//!
//! ## Errors
//!
//! Validation and storage failures are returned as [`AuthError`]. Flow
//! failures of popups and redirects are reported through [`Outcome`] with
//! a stable [`AuthErrorCode`].

pub mod auth;
pub mod backend;
pub mod change_bus;
pub mod error;
pub mod keys;
pub mod pending;
pub mod persistence;
pub mod provider;
pub mod record;
pub mod resolver;
pub mod state;
pub mod types;
pub mod verification;

pub use auth::{Auth, AuthCollaborators};
pub use backend::{
    BackendSignIn, ChallengeToken, ChallengeVerifier, CodeConfirmation, HandoffCompletion,
    IdentityBackend,
};
pub use error::{AuthError, AuthErrorCode, BackendError, Result};
pub use provider::{AuthProvider, OAuthProvider};
pub use resolver::{CompletionMessage, CompletionStatus};
pub use state::{AuthSnapshot, ObserverHandle};
pub use types::{
    AuthAction, AuthCredential, AuthState, Outcome, OutcomeError, ProviderLink, SessionCredential,
    UserCredential, UserId, UserMetadata, UserRecord,
};
pub use verification::{VerificationSessionHandle, VerificationState};

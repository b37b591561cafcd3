//! Workspace facade crate.
//!
//! Re-exports the session-persistence and sign-in core together with the
//! host bridge contracts so applications can depend on a single package.
//! Enable `desktop-shims` (default) to pull in the native storage backends.

pub use bridge_traits;
pub use core_auth;
pub use core_runtime;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop;

pub use core_auth::{Auth, AuthCollaborators, AuthError, Outcome, UserCredential, UserRecord};
pub use core_runtime::config::AuthConfig;

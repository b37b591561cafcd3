use crate::types::AuthCredential;
use bridge_traits::{BridgeError, StorageScope};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Storage backend '{scope}' is unavailable in this environment")]
    StorageUnsupported { scope: StorageScope },

    #[error("Popup window was blocked")]
    PopupBlocked,

    #[error("Popup window was closed by the user")]
    PopupClosedByUser,

    #[error("Cancelled by a newer popup request")]
    CancelledByNewRequest,

    #[error("No pending redirect")]
    NoPendingRedirect,

    #[error("Operation was superseded by a newer one of the same kind")]
    Superseded,

    #[error("Verification challenge expired, obtain a fresh challenge")]
    VerificationChallengeExpired,

    #[error("Verification code does not match")]
    VerificationCodeMismatch,

    #[error("Identity backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Re-authentication returned a different user")]
    UserMismatch,

    #[error("No user is signed in")]
    NoCurrentUser,

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Stable code surfaced to callers.
    pub fn code(&self) -> AuthErrorCode {
        match self {
            AuthError::StorageUnsupported { .. } => AuthErrorCode::StorageUnsupported,
            AuthError::PopupBlocked => AuthErrorCode::PopupBlocked,
            AuthError::PopupClosedByUser => AuthErrorCode::PopupClosedByUser,
            AuthError::CancelledByNewRequest => AuthErrorCode::CancelledByNewRequest,
            AuthError::NoPendingRedirect => AuthErrorCode::NoPendingRedirect,
            AuthError::Superseded => AuthErrorCode::Superseded,
            AuthError::VerificationChallengeExpired => AuthErrorCode::VerificationChallengeExpired,
            AuthError::VerificationCodeMismatch => AuthErrorCode::VerificationCodeMismatch,
            AuthError::BackendUnreachable(_) => AuthErrorCode::BackendUnreachable,
            AuthError::InvalidArgument(_) => AuthErrorCode::InvalidArgument,
            AuthError::UserMismatch => AuthErrorCode::UserMismatch,
            AuthError::NoCurrentUser => AuthErrorCode::NoCurrentUser,
            AuthError::Storage(_)
            | AuthError::Serialization(_)
            | AuthError::Config(_)
            | AuthError::Internal(_) => AuthErrorCode::InternalError,
        }
    }
}

impl From<BridgeError> for AuthError {
    fn from(err: BridgeError) -> Self {
        AuthError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::Serialization(err.to_string())
    }
}

impl From<core_runtime::Error> for AuthError {
    fn from(err: core_runtime::Error) -> Self {
        AuthError::Config(err.to_string())
    }
}

impl From<BackendError> for AuthError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unreachable(reason) | BackendError::Rejected { reason, .. } => {
                AuthError::BackendUnreachable(reason)
            }
            BackendError::CodeMismatch => AuthError::VerificationCodeMismatch,
            BackendError::ChallengeExpired => AuthError::VerificationChallengeExpired,
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// Closed set of error codes reported through outcomes and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthErrorCode {
    StorageUnsupported,
    PopupBlocked,
    PopupClosedByUser,
    CancelledByNewRequest,
    NoPendingRedirect,
    Superseded,
    VerificationChallengeExpired,
    VerificationCodeMismatch,
    BackendUnreachable,
    UserMismatch,
    NoCurrentUser,
    InvalidArgument,
    InternalError,
}

impl AuthErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthErrorCode::StorageUnsupported => "storage-unsupported",
            AuthErrorCode::PopupBlocked => "popup-blocked",
            AuthErrorCode::PopupClosedByUser => "popup-closed-by-user",
            AuthErrorCode::CancelledByNewRequest => "cancelled-by-new-request",
            AuthErrorCode::NoPendingRedirect => "no-pending-redirect",
            AuthErrorCode::Superseded => "superseded",
            AuthErrorCode::VerificationChallengeExpired => "verification-challenge-expired",
            AuthErrorCode::VerificationCodeMismatch => "verification-code-mismatch",
            AuthErrorCode::BackendUnreachable => "backend-unreachable",
            AuthErrorCode::UserMismatch => "user-mismatch",
            AuthErrorCode::NoCurrentUser => "no-current-user",
            AuthErrorCode::InvalidArgument => "invalid-argument",
            AuthErrorCode::InternalError => "internal-error",
        }
    }
}

impl fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by the identity backend collaborator.
///
/// Never leaves the crate as-is; it is mapped onto [`AuthErrorCode`] first.
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("backend rejected the request: {reason}")]
    Rejected {
        reason: String,
        /// Credential the provider issued before the backend refused it,
        /// e.g. when linking a provider account already used elsewhere.
        partial_credential: Option<AuthCredential>,
    },

    #[error("verification code mismatch")]
    CodeMismatch,

    #[error("challenge token expired or already used")]
    ChallengeExpired,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_kebab_case() {
        assert_eq!(
            AuthError::StorageUnsupported {
                scope: StorageScope::OriginScoped
            }
            .code()
            .as_str(),
            "storage-unsupported"
        );
        assert_eq!(
            AuthError::CancelledByNewRequest.code().as_str(),
            "cancelled-by-new-request"
        );
        assert_eq!(
            AuthError::Serialization("bad".to_string()).code(),
            AuthErrorCode::InternalError
        );
    }

    #[test]
    fn test_backend_errors_are_mapped_opaquely() {
        let err: AuthError = BackendError::Rejected {
            reason: "INVALID_IDP_RESPONSE".to_string(),
            partial_credential: None,
        }
        .into();
        assert_eq!(err.code(), AuthErrorCode::BackendUnreachable);

        let err: AuthError = BackendError::CodeMismatch.into();
        assert_eq!(err.code(), AuthErrorCode::VerificationCodeMismatch);

        let err: AuthError = BackendError::ChallengeExpired.into();
        assert_eq!(err.code(), AuthErrorCode::VerificationChallengeExpired);
    }

    #[test]
    fn test_bridge_error_maps_to_storage() {
        let err: AuthError = BridgeError::QuotaExceeded {
            key: "identity:authUser:k:app".to_string(),
        }
        .into();
        assert!(matches!(err, AuthError::Storage(_)));
    }
}

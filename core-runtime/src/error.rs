use std::time::Duration;
use thiserror::Error;

/// Failures raised while assembling or starting the runtime.
///
/// These never reach `Auth` callers as-is; `core-auth` folds them into
/// `AuthError::Config`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{field} is required")]
    MissingField { field: &'static str },

    #[error("{field} cannot be empty")]
    EmptyField { field: &'static str },

    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("{field} must be shorter than {max:?}, got {actual:?}")]
    TooLong {
        field: &'static str,
        max: Duration,
        actual: Duration,
    },

    #[error("Capability missing: {capability} - {message}")]
    CapabilityMissing { capability: String, message: String },

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, Error>;

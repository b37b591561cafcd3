use thiserror::Error;

/// Failures reported by a host capability.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The capability exists on this host but will not serve requests
    /// (storage disabled by policy, private browsing, no data directory).
    #[error("{capability} is unavailable: {reason}")]
    Unavailable {
        capability: &'static str,
        reason: String,
    },

    #[error("Storage quota exceeded for key {key}")]
    QuotaExceeded { key: String },

    /// The host accepted the call but declined to carry it out.
    #[error("Host refused {operation}: {reason}")]
    Refused {
        operation: &'static str,
        reason: String,
    },

    #[error("Stored data could not be encoded: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn storage_unavailable(reason: impl Into<String>) -> Self {
        BridgeError::Unavailable {
            capability: "KeyValueStorage",
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

//! Persisted record envelope
//!
//! Every value the core writes is wrapped as
//! `{"type": <record type>, "version": <u32>, "data": {...}}` so readers can
//! tell records apart and newer writers can add fields without breaking
//! older readers.

use crate::error::{AuthError, Result};
use crate::types::OperationKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version written by this build. Readers accept any version.
pub const RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordType {
    User,
    PendingPopup,
    PendingRedirect,
    VerificationSession,
    /// A type written by some other build
    #[serde(other)]
    Unknown,
}

impl RecordType {
    pub fn for_marker(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Popup => RecordType::PendingPopup,
            OperationKind::Redirect => RecordType::PendingRedirect,
            OperationKind::Verification => RecordType::VerificationSession,
        }
    }
}

/// Why a stored value could not be read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not an envelope, or the payload does not match the record type
    Malformed(String),
    /// A well-formed envelope of another record type
    UnexpectedType {
        expected: RecordType,
        found: RecordType,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Malformed(reason) => write!(f, "malformed record: {}", reason),
            DecodeError::UnexpectedType { expected, found } => {
                write!(f, "expected {:?} record, found {:?}", expected, found)
            }
        }
    }
}

#[derive(Serialize)]
struct EnvelopeOut<'a, T> {
    #[serde(rename = "type")]
    record_type: RecordType,
    version: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    #[serde(rename = "type")]
    record_type: RecordType,
    #[allow(dead_code)]
    version: u32,
    data: serde_json::Value,
}

pub fn encode<T: Serialize>(record_type: RecordType, data: &T) -> Result<String> {
    serde_json::to_string(&EnvelopeOut {
        record_type,
        version: RECORD_VERSION,
        data,
    })
    .map_err(AuthError::from)
}

pub fn decode<T: DeserializeOwned>(
    raw: &str,
    expected: RecordType,
) -> std::result::Result<T, DecodeError> {
    let envelope: EnvelopeIn =
        serde_json::from_str(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    if envelope.record_type != expected {
        return Err(DecodeError::UnexpectedType {
            expected,
            found: envelope.record_type,
        });
    }

    serde_json::from_value(envelope.data).map_err(|e| DecodeError::Malformed(e.to_string()))
}

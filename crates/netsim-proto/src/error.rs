use serde::{Deserialize, Serialize};

/// The error taxonomy. This is kinds, not concrete error types: every
/// module-level `thiserror` enum across the workspace maps into one of
/// these via a `kind()` method, and this is the only shape that crosses
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    AddressConflict,
    Privilege,
    KernelError,
    ResourceExhausted,
    Timeout,
    Internal,
}

/// Wire-level error object: `{kind, message}`.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

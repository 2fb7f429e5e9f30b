use netsim_proto::ErrorKind;
use thiserror::Error;

use crate::link::LinkError;
use crate::namespace::NamespaceError;
use crate::observer::ObserverError;
use crate::pty::PtyError;

/// Top-level error aggregating every module's `thiserror` enum via `#[from]`,
/// the way `TestbenchError` aggregates `NetNsError`/`VethError`/`AddrError`
/// in the source tree.
#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error(transparent)]
    Namespace(#[from] NamespaceError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error(transparent)]
    Observer(#[from] ObserverError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("address conflict: {0}")]
    AddressConflict(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("internal error [{correlation_id}]: {message}")]
    Internal {
        correlation_id: String,
        message: String,
    },
}

impl EmulatorError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            correlation_id: uuid_like_id(),
            message: message.into(),
        }
    }

    /// Maps every variant, at every depth, to one of the nine taxonomy kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EmulatorError::Namespace(e) => e.kind(),
            EmulatorError::Link(e) => e.kind(),
            EmulatorError::Pty(e) => e.kind(),
            EmulatorError::Observer(e) => e.kind(),
            EmulatorError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            EmulatorError::NotFound(_) => ErrorKind::NotFound,
            EmulatorError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            EmulatorError::AddressConflict(_) => ErrorKind::AddressConflict,
            EmulatorError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            EmulatorError::Timeout(_) => ErrorKind::Timeout,
            EmulatorError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn to_api_error(&self) -> netsim_proto::ApiError {
        netsim_proto::ApiError::new(self.kind(), self.to_string())
    }
}

/// Small dependency-free correlation id generator; not a UUID implementation,
/// just unique enough for log correlation within one process lifetime.
fn uuid_like_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("corr-{n:016x}")
}

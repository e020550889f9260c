//! Error classification shared by every tessera crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse error kinds surfaced to API clients.
///
/// Each crate has its own error enum; all of them map onto one of these
/// through a `kind()` method so callers can react uniformly (retry on
/// `Resolve`, report `Configuration` back to the admin, and so on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Resolve,
    TabletNotMounted,
    OperationHangup,
    PrerequisiteTransactionAborted,
    ResourceLimitExceeded,
    SafeMode,
    AccessDenied,
    NotFound,
    AlreadyExists,
    InvalidState,
    Throttled,
    Internal,
}

/// Errors raised by core parsing and validation.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid tag {tag:?}: {reason}")]
    InvalidTag { tag: String, reason: String },

    #[error("invalid tag filter {filter:?}: {reason}")]
    InvalidTagFilter { filter: String, reason: String },

    #[error("unknown subject {0:?} in ACL")]
    UnknownSubject(String),

    #[error("config error: {0}")]
    Config(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

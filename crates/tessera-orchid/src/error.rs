//! Event log and orchid error types.

use tessera_core::ErrorKind;
use thiserror::Error;

/// Result type alias for event log and orchid operations.
pub type OrchidResult<T> = Result<T, OrchidError>;

#[derive(Debug, Error)]
pub enum OrchidError {
    /// Nothing lives at this orchid path. Clients retry these.
    #[error("cannot resolve orchid path {0:?}")]
    Resolve(String),

    #[error("event sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("event sink unavailable: {0}")]
    SinkUnavailable(String),
}

impl OrchidError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchidError::Resolve(_) => ErrorKind::Resolve,
            _ => ErrorKind::Internal,
        }
    }
}

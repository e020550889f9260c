//! Error types for the Tessera state store.

use std::fmt;

use tessera_core::ErrorKind;
use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// The redb call that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbStage {
    Open,
    Transaction,
    Table,
    Read,
    Write,
}

impl fmt::Display for DbStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DbStage::Open => "open",
            DbStage::Transaction => "transaction",
            DbStage::Table => "table",
            DbStage::Read => "read",
            DbStage::Write => "write",
        })
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state store {stage} failed: {message}")]
    Database { stage: DbStage, message: String },

    /// A record could not be encoded to or decoded from JSON.
    #[error("state record {direction} failed: {message}")]
    Codec { direction: &'static str, message: String },

    #[error("changelog gap for cell {cell}: expected seq {expected}, got {got}")]
    ChangelogGap { cell: String, expected: u64, got: u64 },
}

impl StateError {
    /// Storage failures are never the caller's fault.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

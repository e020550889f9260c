//! Error types for the bundle and cell store.

use tessera_core::{CellId, CoreError, ErrorKind, Permission};
use tessera_state::StateError;
use thiserror::Error;

/// Result type alias for cell store operations.
pub type CellResult<T> = Result<T, CellError>;

#[derive(Debug, Error)]
pub enum CellError {
    #[error("no such tablet cell bundle: {0}")]
    NoSuchBundle(String),

    #[error("tablet cell bundle {0:?} already exists")]
    BundleExists(String),

    #[error("tablet cell bundle {0:?} is being removed")]
    BundleBeingRemoved(String),

    #[error("no such tablet cell: {0}")]
    NoSuchCell(CellId),

    #[error("no such table: {0}")]
    NoSuchTable(String),

    #[error("table {0:?} already exists")]
    TableExists(String),

    #[error("no such tablet action: {0}")]
    NoSuchTabletAction(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("access denied: user {user:?} has no {permission:?} permission on {object}")]
    AccessDenied {
        user: String,
        permission: Permission,
        object: String,
    },

    #[error("tablet {index} of table {table} is not mounted")]
    TabletNotMounted { table: String, index: usize },

    #[error("tablet {index} of table {table} is frozen")]
    TabletFrozen { table: String, index: usize },

    #[error("invalid tablet state transition: cannot {command} a table in state {state}")]
    InvalidTransition { command: String, state: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("cell {cell} is not writable: {reason}")]
    CellNotWritable { cell: CellId, reason: String },

    #[error("cell {0} has no leader")]
    NoLeader(CellId),

    #[error("bundle {0:?} has no running cells to mount tablets on")]
    NoHealthyCells(String),

    #[error("{owner} is over {resource} limit: usage {usage} + {delta} > {limit}")]
    ResourceLimitExceeded {
        owner: String,
        resource: String,
        usage: u64,
        delta: u64,
        limit: u64,
    },

    #[error("cluster is in safe mode")]
    SafeMode,

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl CellError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CellError::NoSuchBundle(_)
            | CellError::NoSuchCell(_)
            | CellError::NoSuchTable(_)
            | CellError::NoSuchTabletAction(_) => ErrorKind::NotFound,
            CellError::BundleExists(_) | CellError::TableExists(_) => ErrorKind::AlreadyExists,
            CellError::Configuration(_) | CellError::Core(_) => ErrorKind::Configuration,
            CellError::AccessDenied { .. } => ErrorKind::AccessDenied,
            CellError::TabletNotMounted { .. } => ErrorKind::TabletNotMounted,
            CellError::ResourceLimitExceeded { .. } => ErrorKind::ResourceLimitExceeded,
            CellError::SafeMode => ErrorKind::SafeMode,
            CellError::State(_) => ErrorKind::Internal,
            CellError::BundleBeingRemoved(_)
            | CellError::TabletFrozen { .. }
            | CellError::InvalidTransition { .. }
            | CellError::InvalidState(_)
            | CellError::CellNotWritable { .. }
            | CellError::NoLeader(_)
            | CellError::NoHealthyCells(_) => ErrorKind::InvalidState,
        }
    }
}

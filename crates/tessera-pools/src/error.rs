//! Error types for pool tree edits and operation placement.

use tessera_core::{CoreError, ErrorKind, OperationId, Permission};
use thiserror::Error;

/// Result type alias for pool tree operations.
pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no such pool tree: {0}")]
    NoSuchTree(String),

    #[error("pool tree {0:?} already exists")]
    TreeExists(String),

    #[error("no such pool {pool:?} in tree {tree:?}")]
    NoSuchPool { tree: String, pool: String },

    #[error("pool {0:?} already exists")]
    PoolExists(String),

    #[error("operation {0} is not registered in this tree")]
    NoSuchOperation(OperationId),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("access denied: user {user:?} has no {permission:?} permission on pool {pool:?}")]
    AccessDenied {
        user: String,
        permission: Permission,
        pool: String,
    },

    #[error("limit of {limit} operations reached in {scope}")]
    TooManyOperations { scope: String, limit: usize },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::NoSuchTree(_)
            | PoolError::NoSuchPool { .. }
            | PoolError::NoSuchOperation(_) => ErrorKind::NotFound,
            PoolError::TreeExists(_) | PoolError::PoolExists(_) => ErrorKind::AlreadyExists,
            PoolError::Configuration(_) | PoolError::Core(_) => ErrorKind::Configuration,
            PoolError::AccessDenied { .. } => ErrorKind::AccessDenied,
            PoolError::TooManyOperations { .. } => ErrorKind::ResourceLimitExceeded,
            PoolError::InvalidState(_) => ErrorKind::InvalidState,
        }
    }
}

//! Scheduler error types.

use tessera_core::{CoreError, ErrorKind, JobId, OperationId};
use tessera_pools::PoolError;
use tessera_state::StateError;
use thiserror::Error;

/// Errors that can occur during operation and heartbeat handling.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no such operation: {0}")]
    NoSuchOperation(OperationId),

    #[error("no such job: {0}")]
    NoSuchJob(JobId),

    #[error("unknown node {0:?}")]
    UnknownNode(String),

    #[error("operation {id} is {state}, expected {expected}")]
    WrongOperationState {
        id: OperationId,
        state: String,
        expected: &'static str,
    },

    #[error("invalid operation spec: {0}")]
    InvalidSpec(String),

    #[error("heartbeat from {address} rejected: {in_flight} heartbeats in flight")]
    Throttled { address: String, in_flight: usize },

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::NoSuchOperation(_) | SchedulerError::NoSuchJob(_) | SchedulerError::UnknownNode(_) => {
                ErrorKind::NotFound
            }
            SchedulerError::WrongOperationState { .. } => ErrorKind::InvalidState,
            SchedulerError::InvalidSpec(_) => ErrorKind::Configuration,
            SchedulerError::Throttled { .. } => ErrorKind::Throttled,
            SchedulerError::Pool(e) => e.kind(),
            SchedulerError::State(e) => e.kind(),
            SchedulerError::Core(e) => e.kind(),
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

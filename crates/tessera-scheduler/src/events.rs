//! Scheduler decisions, reported to the event log.

use std::collections::BTreeMap;

use serde::Serialize;

use tessera_core::{JobId, Millis, OperationId, ResourceVector};

use crate::job::{AbortReason, PreemptedFor};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEventKind {
    OperationStarted {
        operation_id: OperationId,
        user: String,
        pools: BTreeMap<String, String>,
    },
    OperationCompleted {
        operation_id: OperationId,
    },
    OperationAborted {
        operation_id: OperationId,
    },
    OperationFailed {
        operation_id: OperationId,
        error: String,
    },
    JobStarted {
        job_id: JobId,
        operation_id: OperationId,
        node: String,
        tree: String,
        resources: ResourceVector,
    },
    JobCompleted {
        job_id: JobId,
        operation_id: OperationId,
        node: String,
    },
    JobAborted {
        job_id: JobId,
        operation_id: OperationId,
        node: String,
        reason: AbortReason,
        preempted_for: Option<PreemptedFor>,
    },
    PoolCreated {
        tree: String,
        pool: String,
        ephemeral: bool,
    },
    PoolRemoved {
        tree: String,
        pool: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerEvent {
    pub at: Millis,
    #[serde(flatten)]
    pub kind: SchedulerEventKind,
}

impl SchedulerEvent {
    pub fn new(at: Millis, kind: SchedulerEventKind) -> Self {
        Self { at, kind }
    }
}

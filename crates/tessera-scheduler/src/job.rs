//! Jobs: the unit the scheduler starts on nodes.

use serde::Serialize;

use tessera_core::{JobId, Millis, OperationId, ResourceVector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    /// Graceful preemption asked the job to stop; aborted at the deadline.
    Interrupting { deadline: Millis },
}

/// Why the scheduler aborted a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Preemption,
    ResourceOvercommit,
    NodeLost,
    NodeBanned,
    OperationFinished,
}

/// Who a preempted job made room for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreemptedFor {
    pub operation_id: OperationId,
    pub tree: String,
    pub pool: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub operation: OperationId,
    pub tree: String,
    pub node: String,
    pub resources: ResourceVector,
    pub started_at: Millis,
    pub last_activity_at: Millis,
    pub state: JobState,
    /// No progress reported for the suspicious inactivity timeout.
    pub suspicious: bool,
    pub preempted_for: Option<PreemptedFor>,
}

impl Job {
    pub fn new(operation: OperationId, tree: &str, node: &str, resources: ResourceVector, now: Millis) -> Self {
        Self {
            id: JobId::new(),
            operation,
            tree: tree.to_string(),
            node: node.to_string(),
            resources,
            started_at: now,
            last_activity_at: now,
            state: JobState::Running,
            suspicious: false,
            preempted_for: None,
        }
    }

    pub fn is_interrupting(&self) -> bool {
        matches!(self.state, JobState::Interrupting { .. })
    }

    /// Interruption deadline passed.
    pub fn interrupt_expired(&self, now: Millis) -> bool {
        matches!(self.state, JobState::Interrupting { deadline } if now >= deadline)
    }
}

//! Operations and their specs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tessera_core::{JobId, Millis, OperationId, OperationKind, ResourceVector};
use tessera_nodes::DEFAULT_SEGMENT;

use crate::error::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Waiting for a running slot in some ancestor pool.
    Pending,
    Running,
    Completed,
    Aborted,
    Failed,
}

impl OperationState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Aborted | OperationState::Failed
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationState::Pending => "pending",
            OperationState::Running => "running",
            OperationState::Completed => "completed",
            OperationState::Aborted => "aborted",
            OperationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionMode {
    #[default]
    Normal,
    /// Interrupt first, abort after `job_graceful_interrupt_timeout`.
    Graceful,
}

/// Per-tree overrides of an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeParams {
    pub pool: Option<String>,
    pub resource_limits: Option<ResourceVector>,
    pub weight: Option<f64>,
}

/// The recognized part of an operation spec. Unknown keys are kept in the
/// raw spec and ignored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationSpec {
    pub pool: Option<String>,
    /// Trees to run in; empty means the default tree.
    pub pool_trees: BTreeSet<String>,
    pub scheduling_options_per_pool_tree: BTreeMap<String, TreeParams>,
    pub job_count: u64,
    pub job_resources: ResourceVector,
    pub is_gang: bool,
    pub preemption_mode: PreemptionMode,
    pub scheduling_segment: Option<String>,
    pub resource_limits: Option<ResourceVector>,
    pub weight: Option<f64>,
    pub suspend_on_job_failure: bool,
    pub max_unpreemptable_running_job_count: Option<usize>,
    pub allow_aggressive_starvation_preemption: Option<bool>,
    pub fair_share_starvation_tolerance: Option<f64>,
    pub enable_operation_hangup_check: bool,
    pub enable_limiting_ancestor_check: bool,
}

impl Default for OperationSpec {
    fn default() -> Self {
        Self {
            pool: None,
            pool_trees: BTreeSet::new(),
            scheduling_options_per_pool_tree: BTreeMap::new(),
            job_count: 1,
            job_resources: ResourceVector::cpu(1.0),
            is_gang: false,
            preemption_mode: PreemptionMode::Normal,
            scheduling_segment: None,
            resource_limits: None,
            weight: None,
            suspend_on_job_failure: false,
            max_unpreemptable_running_job_count: None,
            allow_aggressive_starvation_preemption: None,
            fair_share_starvation_tolerance: None,
            enable_operation_hangup_check: true,
            enable_limiting_ancestor_check: true,
        }
    }
}

impl OperationSpec {
    pub fn from_value(spec: &Value) -> SchedulerResult<Self> {
        let parsed: OperationSpec =
            serde_json::from_value(spec.clone()).map_err(|e| SchedulerError::InvalidSpec(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> SchedulerResult<()> {
        if self.job_resources.is_zero() {
            return Err(SchedulerError::InvalidSpec("job_resources must not be empty".into()));
        }
        if let Some(weight) = self.weight
            && weight <= 0.0
        {
            return Err(SchedulerError::InvalidSpec(format!("weight must be positive, got {weight}")));
        }
        if let Some(tolerance) = self.fair_share_starvation_tolerance
            && !(tolerance > 0.0 && tolerance <= 1.0)
        {
            return Err(SchedulerError::InvalidSpec(format!(
                "fair_share_starvation_tolerance must be in (0, 1], got {tolerance}"
            )));
        }
        Ok(())
    }

    pub fn trees(&self, default_tree: &str) -> Vec<String> {
        if self.pool_trees.is_empty() {
            vec![default_tree.to_string()]
        } else {
            self.pool_trees.iter().cloned().collect()
        }
    }

    /// Pool requested for `tree`: the per-tree option, then the spec pool.
    pub fn pool_for(&self, tree: &str) -> Option<&str> {
        self.scheduling_options_per_pool_tree
            .get(tree)
            .and_then(|p| p.pool.as_deref())
            .or(self.pool.as_deref())
    }

    pub fn segment(&self) -> &str {
        self.scheduling_segment.as_deref().unwrap_or(DEFAULT_SEGMENT)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub id: OperationId,
    pub user: String,
    pub kind: OperationKind,
    /// Spec after merging the configured templates.
    pub raw_spec: Value,
    pub spec: OperationSpec,
    pub state: OperationState,
    pub suspended: bool,
    pub submitted_at: Millis,
    pub started_at: Option<Millis>,
    pub finished_at: Option<Millis>,
    /// Tree → pool the operation landed in.
    pub pools: BTreeMap<String, String>,
    /// Tree → effective per-tree parameters.
    pub tree_params: BTreeMap<String, TreeParams>,
    pub pending_job_count: u64,
    pub completed_job_count: u64,
    pub failed_job_count: u64,
    pub aborted_job_count: u64,
    pub running_jobs: BTreeSet<JobId>,
    pub schedule_job_attempts: u64,
    /// Start of the current stretch without a successful job start.
    pub unscheduled_since: Millis,
    /// Closest ancestor whose limits cannot fit one job, and since when.
    pub limiting_ancestor: Option<(String, Millis)>,
    pub error: Option<String>,
}

impl Operation {
    pub fn new(id: OperationId, user: &str, kind: OperationKind, raw_spec: Value, spec: OperationSpec, now: Millis) -> Self {
        let pending_job_count = spec.job_count;
        Self {
            id,
            user: user.to_string(),
            kind,
            raw_spec,
            spec,
            state: OperationState::Pending,
            suspended: false,
            submitted_at: now,
            started_at: None,
            finished_at: None,
            pools: BTreeMap::new(),
            tree_params: BTreeMap::new(),
            pending_job_count,
            completed_job_count: 0,
            failed_job_count: 0,
            aborted_job_count: 0,
            running_jobs: BTreeSet::new(),
            schedule_job_attempts: 0,
            unscheduled_since: now,
            limiting_ancestor: None,
            error: None,
        }
    }

    /// Running, not suspended and with jobs left to start.
    pub fn wants_jobs(&self) -> bool {
        self.state == OperationState::Running && !self.suspended && self.pending_job_count > 0
    }

    /// All jobs done and nothing left to start.
    pub fn is_drained(&self) -> bool {
        self.pending_job_count == 0 && self.running_jobs.is_empty()
    }

    pub fn resource_limits(&self, tree: &str) -> Option<&ResourceVector> {
        self.tree_params
            .get(tree)
            .and_then(|p| p.resource_limits.as_ref())
            .or(self.spec.resource_limits.as_ref())
    }

    pub fn weight(&self, tree: &str) -> f64 {
        self.tree_params
            .get(tree)
            .and_then(|p| p.weight)
            .or(self.spec.weight)
            .unwrap_or(1.0)
    }

    pub(crate) fn check_state(&self, expected: &'static str, ok: bool) -> SchedulerResult<()> {
        if ok {
            Ok(())
        } else {
            Err(SchedulerError::WrongOperationState {
                id: self.id,
                state: self.state.to_string(),
                expected,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spec_defaults_and_per_tree_pool() {
        let spec = OperationSpec::from_value(&json!({
            "pool": "research",
            "scheduling_options_per_pool_tree": {"gpu": {"pool": "gpu_pool"}},
            "job_resources": {"cpu": 2.0},
            "unknown_key": [1, 2, 3],
        }))
        .unwrap();
        assert_eq!(spec.job_count, 1);
        assert!(spec.enable_operation_hangup_check);
        assert_eq!(spec.pool_for("default"), Some("research"));
        assert_eq!(spec.pool_for("gpu"), Some("gpu_pool"));
        assert_eq!(spec.trees("default"), vec!["default".to_string()]);
        assert_eq!(spec.segment(), DEFAULT_SEGMENT);
    }

    #[test]
    fn invalid_specs_are_rejected() {
        assert!(OperationSpec::from_value(&json!({"weight": 0.0})).is_err());
        assert!(OperationSpec::from_value(&json!({"job_resources": {}})).is_err());
        assert!(OperationSpec::from_value(&json!({"job_count": "many"})).is_err());
        assert!(OperationSpec::from_value(&json!({"fair_share_starvation_tolerance": 1.5})).is_err());
    }
}

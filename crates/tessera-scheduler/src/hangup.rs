//! Operation hangup detection.
//!
//! A running operation with pending jobs hangs when either
//!
//! - some ancestor pool's resource limits cannot fit even one of its jobs
//!   (the limiting ancestor), for the limiting-ancestor timeout; or
//! - it has had no successful job start for the safe timeout despite at
//!   least the configured number of schedule attempts.
//!
//! Hung operations are failed with a diagnostic. Both checks can be turned
//! off per tree and per operation. While a limiting ancestor is detected
//! the general check is held off, so disabling the limiting-ancestor check
//! keeps such an operation alive.

use tracing::warn;

use tessera_core::{Millis, OperationId};
use tessera_nodes::NodeRegistry;

use crate::dispatch::fits_named;
use crate::operation::OperationState;
use crate::scheduler::Scheduler;

pub const LIMITING_ANCESTOR_MESSAGE: &str = "Operation has an ancestor whose specified resource limits are too small to satisfy operation's minimum job resource demand";

pub const NO_SCHEDULED_JOBS_MESSAGE: &str = "Operation has no successfully scheduled jobs for a long period";

impl Scheduler {
    pub(crate) fn check_hangups(&mut self, registry: &mut NodeRegistry, now: Millis) {
        let period = self.config.scheduler.operation_hangup_check_period_ms;
        if let Some(last) = self.last_hangup_check
            && now.saturating_sub(last) < period
        {
            return;
        }
        self.last_hangup_check = Some(now);

        let mut hung: Vec<(OperationId, String)> = Vec::new();
        let ids: Vec<OperationId> = self
            .operations
            .values()
            .filter(|op| op.state == OperationState::Running)
            .map(|op| op.id)
            .collect();
        for id in ids {
            if let Some(error) = self.hangup_of(id, now) {
                hung.push((id, error));
            }
        }

        for (id, error) in hung {
            warn!(%id, %error, "operation hung");
            if let Err(e) = self.fail_operation(registry, id, error, now) {
                warn!(%id, error = %e, "failed to fail hung operation");
            }
        }
    }

    /// Refresh the hangup timers of one operation and return the failure
    /// message if it hung.
    fn hangup_of(&mut self, id: OperationId, now: Millis) -> Option<String> {
        let scheduler = &self.config.scheduler;
        let op = self.operations.get(&id)?;
        if op.suspended || op.pending_job_count == 0 {
            let op = self.operations.get_mut(&id)?;
            op.unscheduled_since = now;
            op.schedule_job_attempts = 0;
            op.limiting_ancestor = None;
            return None;
        }

        let mut limiting: Option<(String, String, bool)> = None;
        let mut general_check = op.spec.enable_operation_hangup_check;
        for (tree_name, pool) in &op.pools {
            let Ok(tree) = self.trees.tree(tree_name) else {
                continue;
            };
            let config = tree.config();
            general_check &= config.enable_operation_hangup_check;
            if limiting.is_none()
                && let Some((ancestor, _)) = tree
                    .limits_on_path(pool)
                    .into_iter()
                    .find(|(_, limits)| !fits_named(&op.spec.job_resources, limits))
            {
                limiting = Some((
                    ancestor.to_string(),
                    tree_name.clone(),
                    config.enable_limiting_ancestor_check && op.spec.enable_limiting_ancestor_check,
                ));
            }
        }

        let due_timeout = scheduler.operation_hangup_due_to_limiting_ancestor_safe_timeout_ms;
        let safe_timeout = scheduler.operation_hangup_safe_timeout_ms;
        let min_attempts = scheduler.operation_hangup_min_schedule_job_attempts;
        let op = self.operations.get_mut(&id)?;

        match limiting {
            Some((ancestor, tree, enabled)) => {
                let since = match &op.limiting_ancestor {
                    Some((name, since)) if *name == ancestor => *since,
                    _ => now,
                };
                op.limiting_ancestor = Some((ancestor.clone(), since));
                // The general check does not apply while no job can fit.
                op.unscheduled_since = now;
                op.schedule_job_attempts = 0;
                if enabled && now.saturating_sub(since) >= due_timeout {
                    return Some(format!(
                        "{LIMITING_ANCESTOR_MESSAGE} (pool tree {tree:?}, limiting ancestor {ancestor:?}, job resources {})",
                        serde_json::to_string(&op.spec.job_resources).unwrap_or_default()
                    ));
                }
            }
            None => op.limiting_ancestor = None,
        }

        if general_check
            && now.saturating_sub(op.unscheduled_since) >= safe_timeout
            && op.schedule_job_attempts >= min_attempts
        {
            return Some(format!(
                "{NO_SCHEDULED_JOBS_MESSAGE} ({} schedule attempts since {})",
                op.schedule_job_attempts, op.unscheduled_since
            ));
        }
        None
    }
}

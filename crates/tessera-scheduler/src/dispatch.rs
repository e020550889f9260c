//! Heartbeat processing: job reports, job dispatch and preemption.
//!
//! ```text
//!   heartbeat ─▶ apply reports ─▶ expire interrupts ─▶ node overcommit
//!                                                          │
//!                        (throttled: stop here) ◀──────────┤
//!                                                          ▼
//!                                 non-preemptive dispatch ─▶ preemption
//!                                 lowest satisfaction first   for starving
//!                                                             operations
//! ```

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use tessera_core::{approx_le, JobId, Millis, OperationId, ResourceVector};
use tessera_fairshare::StarvationStatus;
use tessera_nodes::{NodeFlag, NodeRegistry};
use tessera_pools::PoolTree;

use crate::error::{SchedulerError, SchedulerResult};
use crate::events::SchedulerEventKind;
use crate::heartbeat::{HeartbeatRequest, HeartbeatResponse, JobStart};
use crate::job::{AbortReason, Job, JobState, PreemptedFor};
use crate::operation::{Operation, OperationState, PreemptionMode};
use crate::preemption::{classify_jobs, select_victims, Candidate, PreemptionThresholds, RunningJob};
use crate::scheduler::Scheduler;

/// Usage fits the limits on every resource the limits name.
pub(crate) fn fits_named(usage: &ResourceVector, limits: &ResourceVector) -> bool {
    limits.iter().all(|(name, limit)| approx_le(usage.get(name), limit))
}

/// What the dispatcher needs to know about the node, copied out of the
/// registry so the scheduler can be mutated while it is in use.
struct NodeView {
    address: String,
    segment: String,
    trees: Vec<String>,
    free: ResourceVector,
    accepts_jobs: bool,
}

impl Scheduler {
    /// Handle one node heartbeat.
    ///
    /// Reports are always applied. New jobs are started only when
    /// `schedule` is set; the service clears it for heartbeats admitted
    /// above the soft concurrency limit and for banned nodes.
    pub fn process_heartbeat(
        &mut self,
        registry: &mut NodeRegistry,
        request: &HeartbeatRequest,
        schedule: bool,
        now: Millis,
    ) -> SchedulerResult<HeartbeatResponse> {
        let address = request.address.as_str();
        if !registry.heartbeat(address, None, now) {
            return Err(SchedulerError::UnknownNode(address.to_string()));
        }
        let mut response = HeartbeatResponse::default();

        self.apply_reports(registry, request, now);
        self.expire_interrupts(registry, address, now, &mut response);
        self.resolve_overcommit(registry, address, now, &mut response);

        if !schedule {
            response.scheduling_skipped = true;
            debug!(%address, "heartbeat processed without scheduling");
            return Ok(response);
        }
        let Some(view) = self.node_view(registry, address) else {
            return Ok(response);
        };
        if !view.accepts_jobs {
            return Ok(response);
        }

        self.schedule_non_preemptive(registry, &view, now, &mut response);
        self.preempt_for_starving(registry, &view, now, &mut response);

        if !response.jobs_to_start.is_empty() || !response.jobs_to_abort.is_empty() {
            info!(
                %address,
                started = response.jobs_to_start.len(),
                aborted = response.jobs_to_abort.len(),
                interrupted = response.jobs_to_interrupt.len(),
                "heartbeat scheduled"
            );
        }
        Ok(response)
    }

    /// Ban a node: abort every job there. Returns the aborted jobs.
    pub fn ban_node(&mut self, registry: &mut NodeRegistry, address: &str, now: Millis) -> SchedulerResult<Vec<JobId>> {
        if !registry.set_flag(address, NodeFlag::Banned, true) {
            return Err(SchedulerError::UnknownNode(address.to_string()));
        }
        warn!(%address, "node banned");
        Ok(self.abort_jobs_on_node(registry, address, AbortReason::NodeBanned, now))
    }

    fn node_view(&self, registry: &NodeRegistry, address: &str) -> Option<NodeView> {
        let node = registry.get(address)?;
        let trees = self
            .trees
            .iter()
            .filter(|t| t.config().nodes_filter.matches(&node.tags))
            .map(|t| t.name().to_string())
            .collect();
        Some(NodeView {
            address: address.to_string(),
            segment: node.segment().to_string(),
            trees,
            free: node.free_resources(),
            accepts_jobs: node.accepts_scheduler_jobs(),
        })
    }

    // ── Reports ────────────────────────────────────────────────────

    fn apply_reports(&mut self, registry: &mut NodeRegistry, request: &HeartbeatRequest, now: Millis) {
        let address = request.address.as_str();
        let mut touched = BTreeSet::new();

        for id in &request.completed_jobs {
            let Some(job) = self.take_job(registry, *id, address) else {
                continue;
            };
            if let Some(op) = self.operations.get_mut(&job.operation) {
                op.completed_job_count += 1;
                touched.insert(op.id);
            }
            debug!(job = %job.id, operation = %job.operation, %address, "job completed");
            self.emit(
                now,
                SchedulerEventKind::JobCompleted {
                    job_id: job.id,
                    operation_id: job.operation,
                    node: job.node,
                },
            );
        }

        for id in &request.failed_jobs {
            let Some(job) = self.take_job(registry, *id, address) else {
                continue;
            };
            if let Some(op) = self.operations.get_mut(&job.operation) {
                op.failed_job_count += 1;
                op.pending_job_count += 1;
                if op.spec.suspend_on_job_failure && !op.suspended {
                    op.suspended = true;
                    warn!(operation = %op.id, job = %job.id, "job failed, operation suspended");
                } else {
                    warn!(operation = %op.id, job = %job.id, "job failed, will be retried");
                }
            }
        }

        for id in &request.progressed_jobs {
            if let Some(job) = self.jobs.get_mut(id)
                && job.node == address
            {
                job.last_activity_at = now;
                job.suspicious = false;
            }
        }

        for id in touched {
            let drained = self
                .operations
                .get(&id)
                .is_some_and(|op| op.state == OperationState::Running && op.is_drained());
            if drained && let Err(e) = self.complete_operation(registry, id, now) {
                warn!(%id, error = %e, "failed to complete drained operation");
            }
        }
    }

    /// Remove a reported job. Reports for jobs of another node are ignored.
    fn take_job(&mut self, registry: &mut NodeRegistry, id: JobId, address: &str) -> Option<Job> {
        if self.jobs.get(&id).is_none_or(|j| j.node != address) {
            debug!(job = %id, %address, "report for unknown job ignored");
            return None;
        }
        let job = self.jobs.remove(&id)?;
        registry.release_usage(address, &job.resources);
        if let Some(op) = self.operations.get_mut(&job.operation) {
            op.running_jobs.remove(&id);
        }
        Some(job)
    }

    fn expire_interrupts(&mut self, registry: &mut NodeRegistry, address: &str, now: Millis, response: &mut HeartbeatResponse) {
        let expired: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| j.node == address && j.interrupt_expired(now))
            .map(|j| j.id)
            .collect();
        for id in expired {
            if self.abort_job(registry, id, AbortReason::Preemption, now).is_some() {
                response.jobs_to_abort.push((id, AbortReason::Preemption));
            }
        }
    }

    /// Abort the youngest jobs of a node that has been overcommitted for
    /// longer than the allowed window, until its usage fits.
    fn resolve_overcommit(&mut self, registry: &mut NodeRegistry, address: &str, now: Millis, response: &mut HeartbeatResponse) {
        let allowed = self.config.scheduler.allowed_node_resources_overcommit_duration_ms;
        let Some(node) = registry.get(address) else {
            return;
        };
        let expired = node.is_overcommitted()
            && node
                .overcommit_since
                .is_some_and(|since| now.saturating_sub(since) >= allowed);
        if !expired {
            return;
        }

        let mut youngest: Vec<(Millis, JobId)> = self
            .jobs
            .values()
            .filter(|j| j.node == address)
            .map(|j| (j.started_at, j.id))
            .collect();
        youngest.sort_by(|a, b| b.cmp(a));
        for (_, id) in youngest {
            if registry.get(address).is_none_or(|n| !n.is_overcommitted()) {
                break;
            }
            if self.abort_job(registry, id, AbortReason::ResourceOvercommit, now).is_some() {
                response.jobs_to_abort.push((id, AbortReason::ResourceOvercommit));
            }
        }
        if let Some(node) = registry.get_mut(address)
            && !node.is_overcommitted()
        {
            node.overcommit_since = None;
        }
        warn!(%address, "node overcommit resolved by aborting jobs");
    }

    // ── Job bookkeeping ────────────────────────────────────────────

    fn start_job(&mut self, registry: &mut NodeRegistry, id: OperationId, tree: &str, address: &str, now: Millis) -> Option<JobStart> {
        let op = self.operations.get_mut(&id)?;
        let job = Job::new(id, tree, address, op.spec.job_resources.clone(), now);
        op.pending_job_count = op.pending_job_count.saturating_sub(1);
        op.running_jobs.insert(job.id);
        op.schedule_job_attempts = 0;
        op.unscheduled_since = now;
        registry.add_usage(address, &job.resources);

        let start = JobStart {
            job_id: job.id,
            operation_id: id,
            resources: job.resources.clone(),
        };
        debug!(job = %job.id, operation = %id, %address, tree, "job started");
        self.emit(
            now,
            SchedulerEventKind::JobStarted {
                job_id: job.id,
                operation_id: id,
                node: address.to_string(),
                tree: tree.to_string(),
                resources: job.resources.clone(),
            },
        );
        self.jobs.insert(job.id, job);
        Some(start)
    }

    /// Abort a running job and release its resources. Unless the operation
    /// itself is finishing, the job goes back to the pending count.
    pub(crate) fn abort_job(&mut self, registry: &mut NodeRegistry, id: JobId, reason: AbortReason, now: Millis) -> Option<Job> {
        let job = self.jobs.remove(&id)?;
        registry.release_usage(&job.node, &job.resources);
        if let Some(op) = self.operations.get_mut(&job.operation) {
            op.running_jobs.remove(&id);
            if reason != AbortReason::OperationFinished {
                op.aborted_job_count += 1;
                op.pending_job_count += 1;
            }
        }
        debug!(job = %id, operation = %job.operation, node = %job.node, ?reason, "job aborted");
        self.emit(
            now,
            SchedulerEventKind::JobAborted {
                job_id: id,
                operation_id: job.operation,
                node: job.node.clone(),
                reason,
                preempted_for: job.preempted_for.clone(),
            },
        );
        Some(job)
    }

    pub(crate) fn abort_jobs_on_node(
        &mut self,
        registry: &mut NodeRegistry,
        address: &str,
        reason: AbortReason,
        now: Millis,
    ) -> Vec<JobId> {
        let ids: Vec<JobId> = self.jobs.values().filter(|j| j.node == address).map(|j| j.id).collect();
        for id in &ids {
            self.abort_job(registry, *id, reason, now);
        }
        if !ids.is_empty() {
            info!(%address, count = ids.len(), ?reason, "jobs on node aborted");
        }
        ids
    }

    // ── Placement checks ───────────────────────────────────────────

    /// Usage of the jobs of every operation in the subtree of `pool`.
    fn pool_usage(&self, tree: &PoolTree, pool: &str) -> ResourceVector {
        self.jobs
            .values()
            .filter(|j| j.tree == tree.name())
            .filter(|j| {
                tree.operation(j.operation)
                    .is_some_and(|o| tree.is_in_subtree(&o.pool, pool))
            })
            .fold(ResourceVector::zero(), |acc, j| acc.add(&j.resources))
    }

    /// One more job of `op` stays within its own limits and the limits of
    /// every ancestor pool.
    fn within_limits(&self, op: &Operation, tree: &PoolTree, need: &ResourceVector) -> bool {
        if let Some(limits) = op.resource_limits(tree.name())
            && !fits_named(&self.operation_usage(op.id, tree.name()).add(need), limits)
        {
            return false;
        }
        let Some(placement) = tree.operation(op.id) else {
            return false;
        };
        tree.limits_on_path(&placement.pool)
            .into_iter()
            .all(|(pool, limits)| fits_named(&self.pool_usage(tree, pool).add(need), limits))
    }

    /// Usage over fair share from the last fair-share update. Operations
    /// not yet seen by an update come first.
    fn live_satisfaction(&self, id: OperationId, tree: &str) -> f64 {
        match self.shares(tree).and_then(|s| s.operation(id)) {
            Some(share) => ResourceVector::satisfaction(&self.operation_usage(id, tree), &share.fair_share_resources),
            None => 0.0,
        }
    }

    fn min_spare(&self) -> ResourceVector {
        self.config.min_spare_job_resources_on_node.clone().unwrap_or_default()
    }

    // ── Non-preemptive dispatch ────────────────────────────────────

    fn schedule_non_preemptive(
        &mut self,
        registry: &mut NodeRegistry,
        view: &NodeView,
        now: Millis,
        response: &mut HeartbeatResponse,
    ) {
        let mut tried: BTreeSet<OperationId> = BTreeSet::new();
        let mut started: BTreeSet<OperationId> = BTreeSet::new();
        let mut free = view.free.clone();

        loop {
            let mut best: Option<((f64, Millis), OperationId, String)> = None;
            for tree_name in &view.trees {
                let Ok(tree) = self.trees.tree(tree_name) else {
                    continue;
                };
                for (id, _) in tree.operations() {
                    let Some(op) = self.operations.get(&id) else {
                        continue;
                    };
                    if !op.wants_jobs() || op.spec.segment() != view.segment {
                        continue;
                    }
                    let need = &op.spec.job_resources;
                    // Held back by pool limits: waiting, not a failed attempt.
                    if !self.within_limits(op, tree, need) {
                        continue;
                    }
                    tried.insert(id);
                    if !need.add(&self.min_spare()).fits(&free) {
                        continue;
                    }
                    let key = (self.live_satisfaction(id, tree_name), op.submitted_at);
                    if best
                        .as_ref()
                        .is_none_or(|(k, _, _)| key.0.total_cmp(&k.0).then(key.1.cmp(&k.1)).is_lt())
                    {
                        best = Some((key, id, tree_name.clone()));
                    }
                }
            }
            let Some((_, id, tree)) = best else {
                break;
            };
            let Some(start) = self.start_job(registry, id, &tree, &view.address, now) else {
                break;
            };
            free = free.sub_saturating(&start.resources);
            started.insert(id);
            response.jobs_to_start.push(start);
        }

        for id in tried.difference(&started) {
            if let Some(op) = self.operations.get_mut(id) {
                op.schedule_job_attempts += 1;
            }
        }
    }

    // ── Preemption ─────────────────────────────────────────────────

    fn preempt_for_starving(&mut self, registry: &mut NodeRegistry, view: &NodeView, now: Millis, response: &mut HeartbeatResponse) {
        for tree in &view.trees {
            let Some(shares) = self.shares(tree) else {
                continue;
            };
            let mut starving: Vec<(f64, OperationId, StarvationStatus)> = shares
                .starving_operations()
                .into_iter()
                .map(|s| (s.satisfaction_ratio, s.id, s.starvation_status))
                .collect();
            starving.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            for (_, id, status) in starving {
                while self.preempt_once(registry, view, tree, id, status, now, response) {}
            }
        }
    }

    /// Free room for one job of a starving operation and start it, or
    /// interrupt gracefully preempted jobs for it. Returns false when
    /// nothing changed.
    #[allow(clippy::too_many_arguments)]
    fn preempt_once(
        &mut self,
        registry: &mut NodeRegistry,
        view: &NodeView,
        tree: &str,
        id: OperationId,
        status: StarvationStatus,
        now: Millis,
        response: &mut HeartbeatResponse,
    ) -> bool {
        let Ok(pool_tree) = self.trees.tree(tree) else {
            return false;
        };
        let Some(op) = self.operations.get(&id) else {
            return false;
        };
        if !op.wants_jobs() || op.spec.segment() != view.segment {
            return false;
        }
        if self.live_satisfaction(id, tree) >= 1.0 {
            return false;
        }
        let need = op.spec.job_resources.clone();
        if !self.within_limits(op, pool_tree, &need) {
            return false;
        }
        let Some(pool) = op.pools.get(tree).cloned() else {
            return false;
        };
        let aggressive = status == StarvationStatus::AggressivelyStarving && self.aggressive_allowed(op, pool_tree, &pool);
        let needed = need.add(&self.min_spare());
        let pending = op.pending_job_count;

        let Some(free) = registry.get(&view.address).map(|n| n.free_resources()) else {
            return false;
        };
        if needed.fits(&free) {
            return self.start_into(registry, id, tree, &view.address, now, response);
        }
        // Jobs already interrupted in favor of this operation cover that
        // many of its pending jobs once they stop.
        let reserved = self
            .jobs
            .values()
            .filter(|j| j.node == view.address && j.is_interrupting())
            .filter(|j| j.preempted_for.as_ref().is_some_and(|p| p.operation_id == id))
            .count() as u64;
        if reserved >= pending {
            return false;
        }

        let candidates = self.preemption_candidates(&view.address, id, aggressive);
        let victims = select_victims(candidates, &free, &needed);
        if victims.is_empty() {
            return false;
        }

        let preempted_for = PreemptedFor {
            operation_id: id,
            tree: tree.to_string(),
            pool,
        };
        let timeout = self.config.scheduler.job_graceful_interrupt_timeout_ms;
        let mut waiting = false;
        for victim in victims {
            let Some(job) = self.jobs.get_mut(&victim.job) else {
                continue;
            };
            job.preempted_for = Some(preempted_for.clone());
            let graceful = self
                .operations
                .get(&job.operation)
                .is_some_and(|o| o.spec.preemption_mode == PreemptionMode::Graceful);
            if graceful {
                job.state = JobState::Interrupting {
                    deadline: now + timeout,
                };
                info!(job = %victim.job, preemptor = %id, "job interrupted for preemption");
                response.jobs_to_interrupt.push(victim.job);
                waiting = true;
            } else if self.abort_job(registry, victim.job, AbortReason::Preemption, now).is_some() {
                info!(job = %victim.job, preemptor = %id, "job preempted");
                response.jobs_to_abort.push((victim.job, AbortReason::Preemption));
            }
        }
        if waiting {
            return true;
        }
        self.start_into(registry, id, tree, &view.address, now, response)
    }

    fn start_into(
        &mut self,
        registry: &mut NodeRegistry,
        id: OperationId,
        tree: &str,
        address: &str,
        now: Millis,
        response: &mut HeartbeatResponse,
    ) -> bool {
        match self.start_job(registry, id, tree, address, now) {
            Some(start) => {
                response.jobs_to_start.push(start);
                true
            }
            None => false,
        }
    }

    /// Neither the operation nor any pool above it opted out of aggressive
    /// preemption.
    fn aggressive_allowed(&self, op: &Operation, tree: &PoolTree, pool: &str) -> bool {
        op.spec.allow_aggressive_starvation_preemption != Some(false)
            && tree
                .path_to_root(pool)
                .iter()
                .all(|p| p.config.allow_aggressive_starvation_preemption != Some(false))
    }

    /// Running jobs on the node that a preemptor may take: jobs of other,
    /// non-starving operations, classified against their own fair share.
    fn preemption_candidates(&self, address: &str, preemptor: OperationId, aggressive: bool) -> Vec<Candidate> {
        let victim_ops: BTreeSet<(OperationId, String)> = self
            .jobs
            .values()
            .filter(|j| j.node == address && j.operation != preemptor && !j.is_interrupting())
            .map(|j| (j.operation, j.tree.clone()))
            .collect();

        let mut candidates = Vec::new();
        for (op_id, tree) in victim_ops {
            let (Some(op), Some(shares), Ok(pool_tree)) =
                (self.operations.get(&op_id), self.shares(&tree), self.trees.tree(&tree))
            else {
                continue;
            };
            let Some(share) = shares.operation(op_id) else {
                continue;
            };
            if share.starvation_status.is_starving() {
                continue;
            }
            let config = pool_tree.config();
            let max_unpreemptable = op
                .spec
                .max_unpreemptable_running_job_count
                .map_or(config.max_unpreemptable_running_job_count, |n| {
                    n.min(config.max_unpreemptable_running_job_count)
                });
            let thresholds = PreemptionThresholds {
                max_unpreemptable_running_job_count: max_unpreemptable,
                satisfaction_threshold: config.preemption_satisfaction_threshold,
                aggressive_satisfaction_threshold: config.aggressive_preemption_satisfaction_threshold,
            };
            let running: Vec<RunningJob<'_>> = op
                .running_jobs
                .iter()
                .filter_map(|j| self.jobs.get(j))
                .filter(|j| j.tree == tree && !j.is_interrupting())
                .map(|j| RunningJob {
                    id: j.id,
                    started_at: j.started_at,
                    resources: &j.resources,
                })
                .collect();
            let satisfaction = self.live_satisfaction(op_id, &tree);
            for (job_id, class) in classify_jobs(&running, &share.fair_share_resources, &shares.total_resources, &thresholds) {
                let Some(job) = self.jobs.get(&job_id) else {
                    continue;
                };
                if job.node == address && class.allows(aggressive) {
                    candidates.push(Candidate {
                        job: job_id,
                        started_at: job.started_at,
                        resources: job.resources.clone(),
                        satisfaction,
                    });
                }
            }
        }
        candidates
    }
}

//! Scheduler core — operations, pool trees and the fair-share tick.
//!
//! The `Scheduler` owns the pool trees, one fair-share engine per tree,
//! every operation and every running job. It is synchronous: the daemon
//! holds it behind a lock and drives it from the fair-share loop and from
//! node heartbeats. Node resource usage lives in the [`NodeRegistry`],
//! which the scheduler updates whenever it starts or aborts a job.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use tessera_core::{
    AlertKind, AlertSet, JobId, Millis, OperationId, OperationKind, PoolTreeConfig, ResourceVector, TesseraConfig,
    UserDirectory,
};
use tessera_fairshare::{FairShareEngine, OperationInput, TreeShares, UpdateInput};
use tessera_nodes::NodeRegistry;
use tessera_pools::{PoolConfig, PoolTree, PoolTrees};
use tessera_state::{FairShareSnapshot, StateStore};

use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{SchedulerEvent, SchedulerEventKind};
use crate::job::{AbortReason, Job};
use crate::operation::{Operation, OperationSpec, OperationState, TreeParams};

pub struct Scheduler {
    pub(crate) config: TesseraConfig,
    pub(crate) trees: PoolTrees,
    pub(crate) engines: BTreeMap<String, FairShareEngine>,
    pub(crate) users: UserDirectory,
    pub(crate) operations: BTreeMap<OperationId, Operation>,
    pub(crate) jobs: BTreeMap<JobId, Job>,
    pub(crate) alerts: AlertSet,
    pub(crate) events: Vec<SchedulerEvent>,
    pub(crate) last_hangup_check: Option<Millis>,
    /// Segments restored from a snapshot, applied when the operation is revived.
    restored_segments: BTreeMap<OperationId, String>,
}

impl Scheduler {
    pub fn new(config: TesseraConfig, users: UserDirectory) -> Self {
        let trees = PoolTrees::from_config(&config);
        let alpha = config.scheduler.historic_usage_ema_alpha;
        let engines = trees
            .names()
            .into_iter()
            .map(|name| {
                let engine = FairShareEngine::new(&name, alpha);
                (name, engine)
            })
            .collect();
        Self {
            config,
            trees,
            engines,
            users,
            operations: BTreeMap::new(),
            jobs: BTreeMap::new(),
            alerts: AlertSet::default(),
            events: Vec::new(),
            last_hangup_check: None,
            restored_segments: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    /// Swap the dynamic config. Trees named by the new config are created
    /// or reconfigured; the next tick sees the new values.
    pub fn apply_config(&mut self, config: TesseraConfig) {
        let created = self.trees.apply_config(&config);
        let alpha = config.scheduler.historic_usage_ema_alpha;
        for name in self.trees.names() {
            self.engines
                .entry(name.clone())
                .or_insert_with(|| FairShareEngine::new(&name, alpha))
                .set_ema_alpha(alpha);
        }
        info!(new_trees = ?created, "scheduler config applied");
        self.config = config;
    }

    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    pub fn users_mut(&mut self) -> &mut UserDirectory {
        &mut self.users
    }

    pub fn alerts(&self) -> &AlertSet {
        &self.alerts
    }

    pub fn trees(&self) -> &PoolTrees {
        &self.trees
    }

    pub fn tree(&self, name: &str) -> SchedulerResult<&PoolTree> {
        Ok(self.trees.tree(name)?)
    }

    pub fn operation(&self, id: OperationId) -> SchedulerResult<&Operation> {
        self.operations
            .get(&id)
            .ok_or(SchedulerError::NoSuchOperation(id))
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values()
    }

    pub fn job(&self, id: JobId) -> SchedulerResult<&Job> {
        self.jobs.get(&id).ok_or(SchedulerError::NoSuchJob(id))
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// Result of the last fair-share update of `tree`.
    pub fn shares(&self, tree: &str) -> Option<&TreeShares> {
        self.engines.get(tree).map(FairShareEngine::shares)
    }

    pub fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn drain_accumulated_usage(&mut self, tree: &str) -> BTreeMap<String, ResourceVector> {
        self.engines
            .get_mut(tree)
            .map(FairShareEngine::drain_accumulated_usage)
            .unwrap_or_default()
    }

    pub(crate) fn emit(&mut self, at: Millis, kind: SchedulerEventKind) {
        self.events.push(SchedulerEvent::new(at, kind));
    }

    /// Current usage of an operation's jobs in one tree.
    pub fn operation_usage(&self, id: OperationId, tree: &str) -> ResourceVector {
        let Some(op) = self.operations.get(&id) else {
            return ResourceVector::zero();
        };
        op.running_jobs
            .iter()
            .filter_map(|j| self.jobs.get(j))
            .filter(|j| j.tree == tree)
            .fold(ResourceVector::zero(), |acc, j| acc.add(&j.resources))
    }

    // ── Pool trees and pools ───────────────────────────────────────

    pub fn create_pool_tree(&mut self, name: &str, config: PoolTreeConfig) -> SchedulerResult<()> {
        self.trees.create_tree(name, config)?;
        let alpha = self.config.scheduler.historic_usage_ema_alpha;
        self.engines
            .insert(name.to_string(), FairShareEngine::new(name, alpha));
        Ok(())
    }

    pub fn remove_pool_tree(&mut self, name: &str) -> SchedulerResult<()> {
        self.trees.remove_tree(name)?;
        self.engines.remove(name);
        self.alerts.clear(AlertKind::PoolTreeGuaranteesOvercommit, name);
        self.alerts.clear(AlertKind::IntegralGuaranteesOvercommit, name);
        self.alerts.clear(AlertKind::FairShareUpdateFailed, name);
        Ok(())
    }

    /// Create a pool, or promote the ephemeral pool of the same name.
    pub fn create_pool(
        &mut self,
        tree: &str,
        name: &str,
        parent: Option<&str>,
        config: PoolConfig,
        now: Millis,
    ) -> SchedulerResult<()> {
        let promoted = self.trees.tree_mut(tree)?.create_pool(name, parent, config, now)?;
        if promoted {
            info!(tree, pool = name, "ephemeral pool promoted");
        } else {
            self.emit(
                now,
                SchedulerEventKind::PoolCreated {
                    tree: tree.to_string(),
                    pool: name.to_string(),
                    ephemeral: false,
                },
            );
        }
        Ok(())
    }

    pub fn update_pool(&mut self, tree: &str, name: &str, config: PoolConfig) -> SchedulerResult<()> {
        Ok(self.trees.tree_mut(tree)?.update_pool_config(name, config)?)
    }

    /// Remove an explicit pool. A pool still holding operations is demoted
    /// to an ephemeral pool instead.
    pub fn remove_pool(&mut self, tree: &str, name: &str, now: Millis) -> SchedulerResult<()> {
        let pool_tree = self.trees.tree_mut(tree)?;
        pool_tree.remove_pool(name)?;
        if !pool_tree.contains(name) {
            self.emit(
                now,
                SchedulerEventKind::PoolRemoved {
                    tree: tree.to_string(),
                    pool: name.to_string(),
                },
            );
        }
        Ok(())
    }

    pub fn move_pool(&mut self, tree: &str, name: &str, new_parent: &str) -> SchedulerResult<()> {
        Ok(self.trees.tree_mut(tree)?.move_pool(name, new_parent)?)
    }

    pub fn rename_pool(&mut self, tree: &str, old: &str, new: &str) -> SchedulerResult<()> {
        self.trees.tree_mut(tree)?.rename_pool(old, new)?;
        if let Some(engine) = self.engines.get_mut(tree) {
            engine.rename_pool(old, new);
        }
        for op in self.operations.values_mut() {
            if let Some(pool) = op.pools.get_mut(tree)
                && pool.as_str() == old
            {
                *pool = new.to_string();
            }
        }
        Ok(())
    }

    pub fn set_user_default_parent(&mut self, tree: &str, user: &str, parent: Option<&str>) -> SchedulerResult<()> {
        Ok(self.trees.tree_mut(tree)?.set_user_default_parent(user, parent)?)
    }

    // ── Operation lifecycle ────────────────────────────────────────

    /// Submit an operation. Templates from the config are merged under
    /// `user_spec`. The operation starts running at once unless an
    /// ancestor pool is at its running operation limit.
    pub fn start_operation(
        &mut self,
        user: &str,
        kind: OperationKind,
        user_spec: &Value,
        now: Millis,
    ) -> SchedulerResult<OperationId> {
        self.register_operation(OperationId::new(), user, kind, user_spec, now)
    }

    /// Re-register an operation that was running before a restart, keeping
    /// its id and the scheduling segment from the snapshot.
    pub fn revive_operation(
        &mut self,
        id: OperationId,
        user: &str,
        kind: OperationKind,
        user_spec: &Value,
        now: Millis,
    ) -> SchedulerResult<OperationId> {
        self.register_operation(id, user, kind, user_spec, now)
    }

    fn register_operation(
        &mut self,
        id: OperationId,
        user: &str,
        kind: OperationKind,
        user_spec: &Value,
        now: Millis,
    ) -> SchedulerResult<OperationId> {
        if self.operations.contains_key(&id) {
            return Err(SchedulerError::WrongOperationState {
                id,
                state: "registered".into(),
                expected: "unknown",
            });
        }
        let raw_spec = self.config.effective_spec(kind, user_spec);
        let mut spec = OperationSpec::from_value(&raw_spec)?;
        if spec.scheduling_segment.is_none()
            && let Some(segment) = self.restored_segments.remove(&id)
        {
            spec.scheduling_segment = Some(segment);
        }

        let tree_names = spec.trees(self.trees.default_tree());
        let mut placed: Vec<(String, String)> = Vec::new();
        let mut created = Vec::new();
        for tree_name in &tree_names {
            let requested = spec.pool_for(tree_name);
            let result = self.trees.tree_mut(tree_name).and_then(|tree| {
                let existed: BTreeSet<String> = tree.pools().map(|p| p.name.clone()).collect();
                let pool = tree.register_operation(id, user, requested, &self.users, now)?;
                Ok((pool, existed))
            });
            match result {
                Ok((pool, existed)) => {
                    let tree = self.trees.tree(tree_name)?;
                    for p in tree.pools().filter(|p| !existed.contains(&p.name)) {
                        created.push((tree_name.clone(), p.name.clone()));
                    }
                    placed.push((tree_name.clone(), pool));
                }
                Err(e) => {
                    for (tree_name, _) in &placed {
                        if let Ok(tree) = self.trees.tree_mut(tree_name) {
                            let _ = tree.unregister_operation(id);
                        }
                    }
                    warn!(%id, user, tree = %tree_name, error = %e, "operation rejected");
                    return Err(e.into());
                }
            }
        }

        let mut op = Operation::new(id, user, kind, raw_spec, spec, now);
        op.tree_params = tree_names
            .iter()
            .map(|t| {
                let params = op.spec.scheduling_options_per_pool_tree.get(t).cloned().unwrap_or_default();
                (t.clone(), params)
            })
            .collect();
        op.pools = placed.into_iter().collect();
        let pools = op.pools.clone();
        self.operations.insert(id, op);

        for (tree, pool) in created {
            self.emit(now, SchedulerEventKind::PoolCreated { tree, pool, ephemeral: true });
        }
        self.emit(
            now,
            SchedulerEventKind::OperationStarted {
                operation_id: id,
                user: user.to_string(),
                pools,
            },
        );
        info!(%id, user, ?kind, "operation submitted");
        self.try_activate(id, now)?;
        Ok(id)
    }

    /// Move a pending operation to running if no ancestor pool in any of
    /// its trees is at its running limit.
    fn try_activate(&mut self, id: OperationId, now: Millis) -> SchedulerResult<bool> {
        let op = self.operation(id)?;
        if op.state != OperationState::Pending {
            return Ok(false);
        }
        let trees: Vec<String> = op.pools.keys().cloned().collect();
        for tree in &trees {
            if let Some(blocker) = self.trees.tree(tree)?.running_blocker(id)? {
                debug!(%id, tree = %tree, pool = %blocker, "operation waits for a running slot");
                return Ok(false);
            }
        }
        for tree in &trees {
            self.trees.tree_mut(tree)?.set_running(id, true)?;
        }
        if let Some(op) = self.operations.get_mut(&id) {
            op.state = OperationState::Running;
            op.started_at = Some(now);
            op.unscheduled_since = now;
        }
        info!(%id, "operation running");
        Ok(true)
    }

    /// Promote pending operations, longest waiting first.
    fn promote_pending(&mut self, now: Millis) {
        let mut pending: Vec<(Millis, OperationId)> = self
            .operations
            .values()
            .filter(|op| op.state == OperationState::Pending)
            .map(|op| (op.submitted_at, op.id))
            .collect();
        pending.sort();
        for (_, id) in pending {
            if let Err(e) = self.try_activate(id, now) {
                warn!(%id, error = %e, "failed to promote pending operation");
            }
        }
    }

    pub fn complete_operation(&mut self, registry: &mut NodeRegistry, id: OperationId, now: Millis) -> SchedulerResult<()> {
        let op = self.operation(id)?;
        op.check_state("running", op.state == OperationState::Running)?;
        self.finish_operation(registry, id, OperationState::Completed, None, now)
    }

    pub fn abort_operation(&mut self, registry: &mut NodeRegistry, id: OperationId, now: Millis) -> SchedulerResult<()> {
        let op = self.operation(id)?;
        op.check_state("pending or running", !op.state.is_finished())?;
        self.finish_operation(registry, id, OperationState::Aborted, None, now)
    }

    pub fn fail_operation(
        &mut self,
        registry: &mut NodeRegistry,
        id: OperationId,
        error: String,
        now: Millis,
    ) -> SchedulerResult<()> {
        let op = self.operation(id)?;
        op.check_state("pending or running", !op.state.is_finished())?;
        self.finish_operation(registry, id, OperationState::Failed, Some(error), now)
    }

    fn finish_operation(
        &mut self,
        registry: &mut NodeRegistry,
        id: OperationId,
        state: OperationState,
        error: Option<String>,
        now: Millis,
    ) -> SchedulerResult<()> {
        let jobs: Vec<JobId> = self.operation(id)?.running_jobs.iter().copied().collect();
        for job in jobs {
            self.abort_job(registry, job, AbortReason::OperationFinished, now);
        }

        let trees: Vec<String> = self.operation(id)?.pools.keys().cloned().collect();
        for tree in trees {
            let Ok(pool_tree) = self.trees.tree_mut(&tree) else {
                continue;
            };
            match pool_tree.unregister_operation(id) {
                Ok(Some(pool)) => self.emit(now, SchedulerEventKind::PoolRemoved { tree, pool }),
                Ok(None) => {}
                Err(e) => debug!(%id, tree = %tree, error = %e, "operation was not registered"),
            }
        }

        let kind = match state {
            OperationState::Completed => SchedulerEventKind::OperationCompleted { operation_id: id },
            OperationState::Failed => SchedulerEventKind::OperationFailed {
                operation_id: id,
                error: error.clone().unwrap_or_default(),
            },
            _ => SchedulerEventKind::OperationAborted { operation_id: id },
        };
        if let Some(op) = self.operations.get_mut(&id) {
            op.state = state;
            op.finished_at = Some(now);
            op.pending_job_count = 0;
            if let Some(error) = &error {
                warn!(%id, %error, "operation failed");
            }
            op.error = error;
        }
        info!(%id, %state, "operation finished");
        self.emit(now, kind);
        self.promote_pending(now);
        Ok(())
    }

    pub fn suspend_operation(&mut self, id: OperationId) -> SchedulerResult<()> {
        let op = self
            .operations
            .get_mut(&id)
            .ok_or(SchedulerError::NoSuchOperation(id))?;
        op.check_state("pending or running", !op.state.is_finished())?;
        op.suspended = true;
        info!(%id, "operation suspended");
        Ok(())
    }

    pub fn resume_operation(&mut self, id: OperationId, now: Millis) -> SchedulerResult<()> {
        let op = self
            .operations
            .get_mut(&id)
            .ok_or(SchedulerError::NoSuchOperation(id))?;
        op.check_state("pending or running", !op.state.is_finished())?;
        op.suspended = false;
        op.unscheduled_since = now;
        op.schedule_job_attempts = 0;
        info!(%id, "operation resumed");
        Ok(())
    }

    /// Change an operation's pool, resource limits or weight in one tree.
    pub fn update_operation_parameters(
        &mut self,
        id: OperationId,
        tree: &str,
        params: TreeParams,
        now: Millis,
    ) -> SchedulerResult<()> {
        let op = self.operation(id)?;
        op.check_state("pending or running", !op.state.is_finished())?;
        let old_pool = op
            .pools
            .get(tree)
            .cloned()
            .ok_or_else(|| SchedulerError::InvalidSpec(format!("operation {id} does not run in tree {tree:?}")))?;

        if let Some(pool) = &params.pool {
            let pool_tree = self.trees.tree_mut(tree)?;
            let existed = pool_tree.contains(pool);
            let landed = pool_tree.reassign_operation(id, pool, &self.users, now)?;
            let old_gone = !pool_tree.contains(&old_pool);
            if !existed {
                self.emit(
                    now,
                    SchedulerEventKind::PoolCreated {
                        tree: tree.to_string(),
                        pool: landed.clone(),
                        ephemeral: true,
                    },
                );
            }
            if old_gone {
                self.emit(
                    now,
                    SchedulerEventKind::PoolRemoved {
                        tree: tree.to_string(),
                        pool: old_pool,
                    },
                );
            }
            if let Some(op) = self.operations.get_mut(&id) {
                op.pools.insert(tree.to_string(), landed);
            }
        }
        if let Some(op) = self.operations.get_mut(&id) {
            let current = op.tree_params.entry(tree.to_string()).or_default();
            if params.pool.is_some() {
                current.pool = params.pool;
            }
            if params.resource_limits.is_some() {
                current.resource_limits = params.resource_limits;
            }
            if params.weight.is_some() {
                current.weight = params.weight;
            }
        }
        info!(%id, tree, "operation parameters updated");
        Ok(())
    }

    // ── Fair-share tick ────────────────────────────────────────────

    /// One fair-share pass: node liveness and overcommit timers, one
    /// engine update per tree, hangup detection and suspicious jobs.
    pub fn fair_share_tick(&mut self, registry: &mut NodeRegistry, now: Millis) {
        for address in registry.check_liveness(now) {
            self.abort_jobs_on_node(registry, &address, AbortReason::NodeLost, now);
        }
        let allowed = Duration::from_millis(self.config.scheduler.allowed_node_resources_overcommit_duration_ms);
        let overcommitted = registry.update_overcommit(now, allowed);
        if !overcommitted.is_empty() {
            debug!(nodes = ?overcommitted, "nodes past the overcommit window");
        }

        for tree_name in self.trees.names() {
            if let Err(e) = self.update_tree(registry, &tree_name, now) {
                warn!(tree = %tree_name, error = %e, "fair share update failed");
                self.alerts.raise(
                    AlertKind::FairShareUpdateFailed,
                    &tree_name,
                    format!("fair share update of tree {tree_name:?} failed: {e}"),
                    now,
                );
            }
        }

        self.check_hangups(registry, now);
        self.mark_suspicious_jobs(now);
    }

    fn update_tree(&mut self, registry: &NodeRegistry, tree_name: &str, now: Millis) -> SchedulerResult<()> {
        let tree = self.trees.tree(tree_name)?;
        let filter = tree.config().nodes_filter.clone();
        let total = registry.total_limits(&filter);
        let node_free: Vec<ResourceVector> = registry.schedulable(&filter).map(|n| n.free_resources()).collect();
        let inputs: Vec<OperationInput> = tree
            .operations()
            .filter_map(|(id, _)| self.operations.get(&id))
            .map(|op| OperationInput {
                id: op.id,
                submitted_at: op.submitted_at,
                usage: self.operation_usage(op.id, tree_name),
                pending_job_count: op.pending_job_count,
                job_resources: op.spec.job_resources.clone(),
                resource_limits: op.resource_limits(tree_name).cloned(),
                weight: op.weight(tree_name),
                is_gang: op.spec.is_gang,
                schedulable: op.state == OperationState::Running && !op.suspended,
                fair_share_starvation_tolerance: op.spec.fair_share_starvation_tolerance,
            })
            .collect();

        let input = UpdateInput {
            total,
            operations: &inputs,
            node_free: &node_free,
            now,
        };
        let alpha = self.config.scheduler.historic_usage_ema_alpha;
        let engine = self
            .engines
            .entry(tree_name.to_string())
            .or_insert_with(|| FairShareEngine::new(tree_name, alpha));
        let tree = self.trees.tree_mut(tree_name)?;
        let shares = engine.update(tree, &input, &mut self.alerts);

        if shares.unresolved_operations.is_empty() {
            self.alerts.clear(AlertKind::FairShareUpdateFailed, tree_name);
        } else {
            let message = format!(
                "{} operations of tree {tree_name:?} reference missing pools",
                shares.unresolved_operations.len()
            );
            self.alerts
                .raise(AlertKind::FairShareUpdateFailed, tree_name, message, now);
        }
        debug!(
            tree = tree_name,
            snapshot = shares.snapshot_id,
            operations = shares.operations.len(),
            "fair share updated"
        );

        // Ephemeral pools restored from a snapshot that nobody came back to.
        let tree = self.trees.tree_mut(tree_name)?;
        for pool in tree.prune_ephemeral_pools() {
            self.emit(
                now,
                SchedulerEventKind::PoolRemoved {
                    tree: tree_name.to_string(),
                    pool,
                },
            );
        }
        Ok(())
    }

    fn mark_suspicious_jobs(&mut self, now: Millis) {
        let timeout = self.config.scheduler.suspicious_inactivity_timeout_ms;
        for job in self.jobs.values_mut() {
            if !job.suspicious && now.saturating_sub(job.last_activity_at) >= timeout {
                job.suspicious = true;
                warn!(job = %job.id, operation = %job.operation, node = %job.node, "job looks suspicious: no progress");
            }
        }
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Side snapshot of one tree: pool state, ephemeral pools and the
    /// scheduling segment of every operation in the tree.
    pub fn snapshot(&self, tree: &str, now: Millis) -> SchedulerResult<FairShareSnapshot> {
        let pool_tree = self.trees.tree(tree)?;
        let mut snapshot = pool_tree.snapshot(now);
        snapshot.operation_segments = pool_tree
            .operations()
            .filter_map(|(id, _)| self.operations.get(&id))
            .map(|op| (op.id, op.spec.segment().to_string()))
            .collect();
        Ok(snapshot)
    }

    pub fn restore(&mut self, snapshot: &FairShareSnapshot, now: Millis) -> SchedulerResult<()> {
        self.trees.tree_mut(&snapshot.tree)?.restore(snapshot, now);
        self.restored_segments
            .extend(snapshot.operation_segments.iter().map(|(id, s)| (*id, s.clone())));
        Ok(())
    }

    pub fn save_snapshots(&self, store: &StateStore, now: Millis) -> SchedulerResult<()> {
        for tree in self.trees.names() {
            store.put_fair_share_snapshot(&self.snapshot(&tree, now)?)?;
        }
        Ok(())
    }

    /// Restore every tree that has a stored snapshot. Returns the trees
    /// restored.
    pub fn load_snapshots(&mut self, store: &StateStore, now: Millis) -> SchedulerResult<Vec<String>> {
        let mut restored = Vec::new();
        for tree in self.trees.names() {
            if let Some(snapshot) = store.get_fair_share_snapshot(&tree)? {
                self.restore(&snapshot, now)?;
                restored.push(tree);
            }
        }
        Ok(restored)
    }

    /// Segment of an operation restored from a snapshot and not yet revived.
    pub fn restored_segment(&self, id: OperationId) -> Option<&str> {
        self.restored_segments.get(&id).map(String::as_str)
    }
}

//! The periodic fair-share update.
//!
//! One [`FairShareEngine`] serves one pool tree. Each call to
//! [`FairShareEngine::update`] runs the passes below over an immutable view
//! of the tree (only pool state, i.e. historic usage and integral volume,
//! is written back):
//!
//! ```text
//!   accrue volume ─▶ demand ─▶ strong ─▶ integral ─▶ weighted fill ─▶ fifo truncation
//!                                                        ▲                 │
//!                                                        └── cap & refill ─┘
//!                                         ─▶ vectors ─▶ satisfaction ─▶ starvation
//! ```
//!
//! Shares are dominant shares of the tree's total resources. An entity's
//! fair-share vector is its demand vector scaled to its share, so the
//! vectors of all operations never sum past the total on any resource.

use std::collections::BTreeMap;

use tracing::{debug, info};

use tessera_core::{
    AlertKind, AlertSet, Millis, OperationId, PoolTreeConfig, ResourceVector, EPSILON,
};
use tessera_pools::{HistoricUsageAggregationMode, IntegralGuaranteeType, PoolKind, PoolTree};

use crate::distribute::{fifo_fill, weighted_fill, Claim};
use crate::integral::{
    accrue_volumes, burst_grant, guarantee_pools, relaxed_grants, IntegralClaim, IntegralSettings,
};
use crate::shares::{DetailedFairShare, IntegralInfo, OperationShare, PoolShare, TreeShares};
use crate::starvation::{EntityKey, StarvationParams, StarvationTracker};

/// What the scheduler knows about one operation at update time.
#[derive(Debug, Clone)]
pub struct OperationInput {
    pub id: OperationId,
    pub submitted_at: Millis,
    pub usage: ResourceVector,
    pub pending_job_count: u64,
    /// Resources of one more job (the min-needed vector).
    pub job_resources: ResourceVector,
    pub resource_limits: Option<ResourceVector>,
    pub weight: f64,
    pub is_gang: bool,
    /// Operations that are not running (pending or suspended) have no demand.
    pub schedulable: bool,
    pub fair_share_starvation_tolerance: Option<f64>,
}

impl OperationInput {
    pub fn new(id: OperationId, job_resources: ResourceVector, pending_job_count: u64) -> Self {
        Self {
            id,
            submitted_at: 0,
            usage: ResourceVector::zero(),
            pending_job_count,
            job_resources,
            resource_limits: None,
            weight: 1.0,
            is_gang: false,
            schedulable: true,
            fair_share_starvation_tolerance: None,
        }
    }

    fn demand(&self) -> ResourceVector {
        if !self.schedulable {
            return ResourceVector::zero();
        }
        let pending = self.job_resources.scale(self.pending_job_count as f64);
        let demand = self.usage.add(&pending);
        match &self.resource_limits {
            Some(limits) => cap_to_limits(&demand, limits),
            None => demand,
        }
    }
}

pub struct UpdateInput<'a> {
    pub total: ResourceVector,
    pub operations: &'a [OperationInput],
    /// Free resources of every schedulable node of the tree.
    pub node_free: &'a [ResourceVector],
    pub now: Millis,
}

/// Component-wise cap on the resources `limits` names.
pub fn cap_to_limits(v: &ResourceVector, limits: &ResourceVector) -> ResourceVector {
    let mut out = v.clone();
    for (name, limit) in limits.iter() {
        out.set(name, v.get(name).min(limit));
    }
    out
}

/// Largest `φ ≤ 1` with `φ·demand` within `limits`.
fn limit_fraction(demand: &ResourceVector, limits: &ResourceVector) -> f64 {
    limits
        .iter()
        .filter_map(|(name, limit)| {
            let d = demand.get(name);
            (d > 0.0).then(|| limit / d)
        })
        .fold(1.0, f64::min)
}

// ── Working state of one update ────────────────────────────────

struct PoolNode {
    name: String,
    parent: Option<usize>,
    children: Vec<usize>,
    /// Indexes into `ops`, fifo order.
    ops: Vec<usize>,
    kind: PoolKind,
    demand_vec: ResourceVector,
    demand: f64,
    usage_vec: ResourceVector,
    strong: f64,
    integral_own: f64,
    integral_sub: f64,
    weight: f64,
    fair: f64,
    fair_vec: ResourceVector,
    /// Demand cap left by fifo truncation.
    cap: f64,
    tolerance: f64,
    timeout_ms: u64,
}

struct OpNode {
    input: usize,
    pool: usize,
    demand_vec: ResourceVector,
    demand: f64,
    min_needed: f64,
    fair: f64,
    truncated: bool,
}

pub struct FairShareEngine {
    tree: String,
    ema_alpha: f64,
    last_update: Option<Millis>,
    snapshot_id: u64,
    last_grants: BTreeMap<String, f64>,
    starvation: StarvationTracker,
    unsatisfied: BTreeMap<OperationId, u64>,
    accumulated_usage: BTreeMap<String, ResourceVector>,
    latest: TreeShares,
}

impl FairShareEngine {
    pub fn new(tree: &str, ema_alpha: f64) -> Self {
        Self {
            tree: tree.to_string(),
            ema_alpha,
            last_update: None,
            snapshot_id: 0,
            last_grants: BTreeMap::new(),
            starvation: StarvationTracker::default(),
            unsatisfied: BTreeMap::new(),
            accumulated_usage: BTreeMap::new(),
            latest: TreeShares {
                tree: tree.to_string(),
                ..TreeShares::default()
            },
        }
    }

    pub fn set_ema_alpha(&mut self, alpha: f64) {
        self.ema_alpha = alpha;
    }

    /// Result of the last update.
    pub fn shares(&self) -> &TreeShares {
        &self.latest
    }

    /// Pool usage integrated over time (resource·seconds) since the last drain.
    pub fn drain_accumulated_usage(&mut self) -> BTreeMap<String, ResourceVector> {
        std::mem::take(&mut self.accumulated_usage)
    }

    /// Carry per-pool carry-over state across a pool rename.
    pub fn rename_pool(&mut self, old: &str, new: &str) {
        if let Some(grant) = self.last_grants.remove(old) {
            self.last_grants.insert(new.to_string(), grant);
        }
        if let Some(usage) = self.accumulated_usage.remove(old) {
            *self.accumulated_usage.entry(new.to_string()).or_default() += &usage;
        }
    }

    /// Integral share granted to `pool` by the last update.
    pub fn last_grant(&self, pool: &str) -> Option<f64> {
        self.last_grants.get(pool).copied()
    }

    pub fn update(&mut self, tree: &mut PoolTree, input: &UpdateInput<'_>, alerts: &mut AlertSet) -> &TreeShares {
        let now = input.now;
        let total = &input.total;
        let config = tree.config().clone();
        let dt_secs = self
            .last_update
            .map_or(0.0, |t| now.saturating_sub(t) as f64 / 1000.0);
        self.last_update = Some(now);
        self.snapshot_id += 1;

        let settings = IntegralSettings::new(
            &config.integral_guarantees,
            config.should_distribute_free_volume_among_children,
        );
        accrue_volumes(tree, total, &self.last_grants, dt_secs, &settings);

        let (mut pools, mut ops, unresolved) = index(tree, input, total);
        let post = post_order(&pools);

        // Usage, historic usage and accumulated usage.
        for &p in &post {
            let mut usage = ResourceVector::zero();
            for &c in &pools[p].children {
                usage += &pools[c].usage_vec;
            }
            for &o in &pools[p].ops {
                usage += &input.operations[ops[o].input].usage;
            }
            pools[p].usage_vec = usage;
        }
        for node in &pools {
            if let Some(pool) = tree.pool(&node.name) {
                let alpha = pool
                    .config
                    .historic_usage_config
                    .ema_alpha
                    .unwrap_or(self.ema_alpha);
                let ema = pool.state.historic_usage.clone();
                if let Some(state) = tree.state_mut(&node.name) {
                    state.historic_usage = node.usage_vec.scale(alpha).add(&ema.scale(1.0 - alpha));
                }
            }
            if dt_secs > 0.0 {
                *self.accumulated_usage.entry(node.name.clone()).or_default() +=
                    &node.usage_vec.scale(dt_secs);
            }
        }

        self.strong_pass(tree, &mut pools, &post, total, alerts, now);
        let integral_pools = guarantee_pools(tree);
        let burst_fit = self.validate_guarantees(tree, &mut pools, &integral_pools, total, alerts, now);

        // Weighted fill, refilled while fifo truncation frees share.
        let truncation = config.enable_fair_share_truncation_in_fifo_pool;
        // Every refill truncates at least one more operation.
        let max_rounds = pools
            .iter()
            .filter(|p| p.kind == PoolKind::FifoInner)
            .map(|p| p.ops.len())
            .sum::<usize>()
            + 1;
        for round in 0..max_rounds {
            compute_demand(tree, &mut pools, &ops, &post);
            self.integral_pass(tree, &mut pools, &post, &integral_pools, burst_fit, total, &settings);
            self.assign_weights(tree, &mut pools, total, &config);
            distribute(&mut pools, &mut ops, input);
            if !truncation || !truncate_fifo(&mut pools, &mut ops, input) {
                break;
            }
            debug!(tree = %self.tree, round, "fifo truncation freed share, refilling");
        }

        self.last_grants = pools
            .iter()
            .filter(|p| p.integral_own > 0.0)
            .map(|p| (p.name.clone(), p.integral_own))
            .collect();

        // Fair-share vectors.
        let op_vecs: Vec<ResourceVector> = ops
            .iter()
            .map(|o| o.demand_vec.scale_to_dominant(total, o.fair))
            .collect();
        for &p in &post {
            let mut v = ResourceVector::zero();
            for &c in &pools[p].children {
                v += &pools[c].fair_vec;
            }
            for &o in &pools[p].ops {
                v += &op_vecs[o];
            }
            pools[p].fair_vec = v;
        }

        inherit_starvation_settings(tree, &mut pools, &config);
        self.latest = self.build_shares(tree, &pools, &ops, &op_vecs, unresolved, input, &config);
        &self.latest
    }

    fn strong_pass(
        &self,
        tree: &PoolTree,
        pools: &mut [PoolNode],
        post: &[usize],
        total: &ResourceVector,
        alerts: &mut AlertSet,
        now: Millis,
    ) {
        // Effective guarantee: the specified one, or what the children claim.
        let mut effective = vec![0.0; pools.len()];
        for &p in post {
            let specified = pools[p]
                .parent
                .and(tree.pool(&pools[p].name))
                .and_then(|pool| pool.config.strong_guarantee_resources.as_ref())
                .map(|g| g.dominant(total));
            let children: f64 = pools[p].children.iter().map(|&c| effective[c]).sum();
            effective[p] = specified.unwrap_or(children);
        }

        let root_claim = effective[0];
        if root_claim > 1.0 + EPSILON {
            let message = format!(
                "strong guarantees of tree {:?} claim {:.3} of the total resources",
                self.tree, root_claim
            );
            if alerts.raise(AlertKind::PoolTreeGuaranteesOvercommit, &self.tree, message, now) {
                info!(tree = %self.tree, claim = root_claim, "strong guarantees overcommitted");
            }
        } else if alerts.clear(AlertKind::PoolTreeGuaranteesOvercommit, &self.tree) {
            info!(tree = %self.tree, "strong guarantee overcommit cleared");
        }

        pools[0].strong = root_claim.min(1.0);
        for &p in post.iter().rev() {
            let sum: f64 = pools[p].children.iter().map(|&c| effective[c]).sum();
            let factor = if sum > pools[p].strong + EPSILON {
                pools[p].strong / sum
            } else {
                1.0
            };
            for c in pools[p].children.clone() {
                pools[c].strong = effective[c] * factor;
            }
        }
    }

    /// Scale strong and burst guarantees by a common factor when together
    /// they claim more than the whole tree. Returns the burst factor.
    fn validate_guarantees(
        &self,
        tree: &PoolTree,
        pools: &mut [PoolNode],
        integral_pools: &[String],
        total: &ResourceVector,
        alerts: &mut AlertSet,
        now: Millis,
    ) -> f64 {
        let strong = pools[0].strong;
        let mut burst = 0.0;
        let mut flow = 0.0;
        for name in integral_pools {
            let Some(pool) = tree.pool(name) else {
                continue;
            };
            let ig = &pool.config.integral_guarantees;
            flow += ig.resource_flow.dominant(total);
            if ig.guarantee_type == IntegralGuaranteeType::Burst {
                burst += ig.burst_guarantee_resources.dominant(total);
            }
        }

        let mut fit = 1.0;
        let message = if strong + burst > 1.0 + EPSILON {
            fit = 1.0 / (strong + burst);
            for node in pools.iter_mut() {
                node.strong *= fit;
            }
            Some(format!(
                "strong ({strong:.3}) plus burst ({burst:.3}) guarantees of tree {:?} exceed the total resources",
                self.tree
            ))
        } else if strong + flow > 1.0 + EPSILON {
            Some(format!(
                "strong ({strong:.3}) guarantees plus resource flow ({flow:.3}) of tree {:?} exceed the total resources",
                self.tree
            ))
        } else {
            None
        };
        match message {
            Some(message) => {
                if alerts.raise(AlertKind::IntegralGuaranteesOvercommit, &self.tree, message, now) {
                    info!(tree = %self.tree, strong, burst, flow, "integral guarantees overcommitted");
                }
            }
            None => {
                alerts.clear(AlertKind::IntegralGuaranteesOvercommit, &self.tree);
            }
        }
        fit
    }

    #[allow(clippy::too_many_arguments)]
    fn integral_pass(
        &self,
        tree: &PoolTree,
        pools: &mut [PoolNode],
        post: &[usize],
        integral_pools: &[String],
        burst_fit: f64,
        total: &ResourceVector,
        settings: &IntegralSettings,
    ) {
        for node in pools.iter_mut() {
            node.integral_own = 0.0;
        }
        let position = |name: &str| pools.iter().position(|p| p.name == name);
        let mut bursts = Vec::new();
        let mut relaxed = Vec::new();
        for name in integral_pools {
            let (Some(pool), Some(idx)) = (tree.pool(name), position(name)) else {
                continue;
            };
            let ig = &pool.config.integral_guarantees;
            let claim = IntegralClaim {
                volume_ratio: pool.state.integral_volume.dominant(total),
                flow_ratio: ig.resource_flow.dominant(total),
                burst_ratio: ig.burst_guarantee_resources.dominant(total) * burst_fit,
                demand: pools[idx].demand,
                strong: pools[idx].strong,
            };
            match ig.guarantee_type {
                IntegralGuaranteeType::Burst => bursts.push((idx, claim)),
                IntegralGuaranteeType::Relaxed => relaxed.push((idx, claim)),
                IntegralGuaranteeType::None => {}
            }
        }

        for (idx, claim) in &bursts {
            pools[*idx].integral_own = burst_grant(claim, settings);
        }
        sum_integral(pools, post);

        let committed: f64 = pools[0]
            .children
            .iter()
            .map(|&c| pools[c].demand.min(pools[c].strong + pools[c].integral_sub))
            .sum();
        let available = (1.0 - committed).max(0.0);
        let claims: Vec<IntegralClaim> = relaxed.iter().map(|(_, c)| *c).collect();
        let grants = relaxed_grants(available, &claims, settings);
        for ((idx, _), grant) in relaxed.iter().zip(grants) {
            pools[*idx].integral_own = grant;
        }
        sum_integral(pools, post);
    }

    fn assign_weights(&self, tree: &PoolTree, pools: &mut [PoolNode], total: &ResourceVector, config: &PoolTreeConfig) {
        for i in 1..pools.len() {
            let Some(pool) = tree.pool(&pools[i].name) else {
                continue;
            };
            let mut weight = match (pool.config.weight, config.infer_weight_from_min_share_ratio_multiplier) {
                (Some(w), _) => w,
                (None, Some(k)) => {
                    let flow = pool.config.integral_guarantees.resource_flow.dominant(total);
                    let inferred = k * pools[i].strong + (1.0 - k) * flow;
                    if inferred > EPSILON { inferred } else { 1.0 }
                }
                (None, None) => 1.0,
            };
            let parent_mode = pools[i]
                .parent
                .and_then(|p| tree.pool(&pools[p].name))
                .map(|p| p.config.historic_usage_config.aggregation_mode);
            if parent_mode == Some(HistoricUsageAggregationMode::ExponentialMovingAverage) {
                weight /= 1.0 + pool.state.historic_usage.dominant(total);
            }
            pools[i].weight = weight;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_shares(
        &mut self,
        tree: &PoolTree,
        pools: &[PoolNode],
        ops: &[OpNode],
        op_vecs: &[ResourceVector],
        unresolved: Vec<OperationId>,
        input: &UpdateInput<'_>,
        config: &PoolTreeConfig,
    ) -> TreeShares {
        let now = input.now;
        let total = &input.total;
        let aggressive = |tolerance: f64, timeout_ms: u64| StarvationParams {
            tolerance,
            aggressive_tolerance: config.aggressive_starvation_tolerance.min(tolerance),
            timeout_ms,
            aggressive_timeout_ms: config.fair_share_aggressive_starvation_timeout_ms,
        };

        let mut pool_shares = BTreeMap::new();
        let mut details = Vec::with_capacity(pools.len());
        for node in pools {
            let strong = node.strong.min(node.demand);
            let detail = DetailedFairShare::split(node.fair, strong, node.integral_sub);
            details.push(detail);
            let Some(pool) = tree.pool(&node.name) else {
                continue;
            };
            let usage_ratio = node.usage_vec.dominant(total);
            let satisfaction = ResourceVector::satisfaction(&node.usage_vec, &node.fair_vec);
            let below_strong = strong > EPSILON && usage_ratio < strong * node.tolerance - EPSILON;
            let timeout = if below_strong {
                config.min_share_starvation_timeout_ms
            } else {
                node.timeout_ms
            };
            let status = self.starvation.update(
                EntityKey::Pool(node.name.clone()),
                satisfaction,
                &aggressive(node.tolerance, timeout),
                now,
            );
            let integral = pool.kind.accrues_volume().then(|| integral_info(tree, &node.name, total, config));
            pool_shares.insert(
                node.name.clone(),
                PoolShare {
                    name: node.name.clone(),
                    parent: pool.parent.clone(),
                    kind: pool.kind,
                    mode: pool.config.mode,
                    is_ephemeral: pool.is_ephemeral,
                    weight: node.weight,
                    demand: node.demand_vec.clone(),
                    demand_ratio: node.demand,
                    usage: node.usage_vec.clone(),
                    usage_ratio,
                    resource_limits: pool.config.resource_limits.clone(),
                    strong_guarantee_share: node.strong,
                    fair_share: detail,
                    fair_share_resources: node.fair_vec.clone(),
                    satisfaction_ratio: satisfaction,
                    starvation_status: status,
                    starvation_tolerance: node.tolerance,
                    historic_usage: pool.state.historic_usage.clone(),
                    operation_count: node.ops.len(),
                    integral,
                },
            );
        }

        let mut op_shares = BTreeMap::new();
        for (o, op) in ops.iter().enumerate() {
            let op_input = &input.operations[op.input];
            let pool = &pools[op.pool];
            let pool_config = tree.pool(&pool.name).map(|p| &p.config);
            let tolerance_limit = pool_config
                .and_then(|c| c.fair_share_starvation_tolerance_limit)
                .unwrap_or(1.0);
            let tolerance = op_input
                .fair_share_starvation_tolerance
                .unwrap_or(pool.tolerance)
                .min(tolerance_limit);
            let usage_ratio = op_input.usage.dominant(total);
            let satisfaction = ResourceVector::satisfaction(&op_input.usage, &op_vecs[o]);
            let pool_strong = pool.strong.min(pool.demand);
            let pool_usage = pool.usage_vec.dominant(total);
            let timeout = if pool_strong > EPSILON && pool_usage < pool_strong * tolerance - EPSILON {
                config.min_share_starvation_timeout_ms
            } else {
                pool.timeout_ms
            };
            let key = EntityKey::Operation(op_input.id);
            let status = self
                .starvation
                .update(key.clone(), satisfaction, &aggressive(tolerance, timeout), now);

            let fits_somewhere = input
                .node_free
                .iter()
                .any(|free| op_input.job_resources.fits(free));
            let counter = self.unsatisfied.entry(op_input.id).or_insert(0);
            if status.is_starving() && !fits_somewhere {
                *counter += 1;
            }

            op_shares.insert(
                op_input.id,
                OperationShare {
                    id: op_input.id,
                    pool: pool.name.clone(),
                    weight: op_input.weight,
                    demand: op.demand_vec.clone(),
                    demand_ratio: op.demand,
                    usage: op_input.usage.clone(),
                    usage_ratio,
                    min_needed_resources: op_input.job_resources.clone(),
                    min_needed_ratio: op.min_needed,
                    fair_share: details[op.pool].portion(op.fair),
                    fair_share_resources: op_vecs[o].clone(),
                    satisfaction_ratio: satisfaction,
                    starvation_status: status,
                    starvation_tolerance: tolerance,
                    below_fair_share_since: self.starvation.below_since(&key),
                    min_needed_unsatisfied_count: *counter,
                    truncated: op.truncated,
                },
            );
        }

        self.starvation.retain(|key| match key {
            EntityKey::Pool(name) => pool_shares.contains_key(name),
            EntityKey::Operation(id) => op_shares.contains_key(id),
        });
        self.unsatisfied.retain(|id, _| op_shares.contains_key(id));

        TreeShares {
            tree: self.tree.clone(),
            snapshot_id: self.snapshot_id,
            taken_at: now,
            total_resources: total.clone(),
            pools: pool_shares,
            operations: op_shares,
            unresolved_operations: unresolved,
        }
    }
}

// ── Passes ─────────────────────────────────────────────────────

fn index(
    tree: &PoolTree,
    input: &UpdateInput<'_>,
    total: &ResourceVector,
) -> (Vec<PoolNode>, Vec<OpNode>, Vec<OperationId>) {
    let mut pools: Vec<PoolNode> = tree
        .pools()
        .map(|p| PoolNode {
            name: p.name.clone(),
            parent: None,
            children: Vec::new(),
            ops: Vec::new(),
            kind: p.kind,
            demand_vec: ResourceVector::zero(),
            demand: 0.0,
            usage_vec: ResourceVector::zero(),
            strong: 0.0,
            integral_own: 0.0,
            integral_sub: 0.0,
            weight: 1.0,
            fair: 0.0,
            fair_vec: ResourceVector::zero(),
            cap: f64::INFINITY,
            tolerance: 1.0,
            timeout_ms: 0,
        })
        .collect();
    let position: BTreeMap<String, usize> = pools
        .iter()
        .enumerate()
        .map(|(i, p)| (p.name.clone(), i))
        .collect();
    for i in 0..pools.len() {
        let parent = tree
            .pool(&pools[i].name)
            .and_then(|p| p.parent.as_ref())
            .and_then(|name| position.get(name).copied());
        pools[i].parent = parent;
        if let Some(parent) = parent {
            pools[parent].children.push(i);
        }
    }

    let mut ordered: Vec<(Millis, u64, usize, usize)> = Vec::new();
    let mut unresolved = Vec::new();
    for (i, op) in input.operations.iter().enumerate() {
        let placed = tree
            .operation(op.id)
            .and_then(|placed| position.get(&placed.pool).map(|&p| (p, placed.seq)));
        match placed {
            Some((pool, seq)) => ordered.push((op.submitted_at, seq, i, pool)),
            None => unresolved.push(op.id),
        }
    }
    ordered.sort();
    let mut ops = Vec::with_capacity(ordered.len());
    for (_, _, i, pool) in ordered {
        let op = &input.operations[i];
        let demand_vec = op.demand();
        let demand = demand_vec.dominant(total).min(1.0);
        pools[pool].ops.push(ops.len());
        ops.push(OpNode {
            input: i,
            pool,
            demand_vec,
            demand,
            min_needed: op.job_resources.dominant(total),
            fair: 0.0,
            truncated: false,
        });
    }
    (pools, ops, unresolved)
}

fn post_order(pools: &[PoolNode]) -> Vec<usize> {
    let mut out = Vec::with_capacity(pools.len());
    if pools.is_empty() {
        return out;
    }
    let mut stack = vec![(0usize, false)];
    while let Some((p, expanded)) = stack.pop() {
        if expanded {
            out.push(p);
            continue;
        }
        stack.push((p, true));
        for &c in pools[p].children.iter().rev() {
            stack.push((c, false));
        }
    }
    out
}

fn compute_demand(tree: &PoolTree, pools: &mut [PoolNode], ops: &[OpNode], post: &[usize]) {
    for &p in post {
        let mut vec = ResourceVector::zero();
        let mut ratio = 0.0;
        for &c in &pools[p].children {
            vec += &pools[c].demand_vec;
            ratio += pools[c].demand;
        }
        for &o in &pools[p].ops {
            vec += &ops[o].demand_vec;
            ratio += ops[o].demand;
        }
        if let Some(limits) = tree
            .pool(&pools[p].name)
            .and_then(|pool| pool.config.resource_limits.as_ref())
        {
            let phi = limit_fraction(&vec, limits);
            vec = vec.scale(phi);
            ratio *= phi;
        }
        let capped = ratio.min(pools[p].cap).min(1.0);
        if capped < ratio && ratio > 0.0 {
            vec = vec.scale(capped / ratio);
        }
        pools[p].demand_vec = vec;
        pools[p].demand = capped;
    }
}

fn sum_integral(pools: &mut [PoolNode], post: &[usize]) {
    for &p in post {
        let children: f64 = pools[p].children.iter().map(|&c| pools[c].integral_sub).sum();
        pools[p].integral_sub = pools[p].integral_own + children;
    }
}

fn guarantee(node: &PoolNode) -> f64 {
    node.demand.min(node.strong + node.integral_sub)
}

fn distribute(pools: &mut [PoolNode], ops: &mut [OpNode], input: &UpdateInput<'_>) {
    pools[0].fair = pools[0].demand.min(1.0);
    let mut stack = vec![0usize];
    while let Some(p) = stack.pop() {
        let available = pools[p].fair;
        let children = pools[p].children.clone();
        let op_ids = pools[p].ops.clone();
        let mut claims: Vec<Claim> = children
            .iter()
            .map(|&c| Claim::new(pools[c].demand, guarantee(&pools[c]), pools[c].weight))
            .collect();

        if pools[p].kind == PoolKind::FifoInner {
            let op_demand: f64 = op_ids.iter().map(|&o| ops[o].demand).sum();
            claims.push(Claim::new(op_demand, 0.0, 1.0));
            let shares = weighted_fill(available, &claims);
            let block = shares.last().copied().unwrap_or(0.0);
            let demands: Vec<f64> = op_ids.iter().map(|&o| ops[o].demand).collect();
            for (&o, share) in op_ids.iter().zip(fifo_fill(block, &demands)) {
                ops[o].fair = share;
            }
            for (&c, share) in children.iter().zip(shares) {
                pools[c].fair = share;
            }
        } else {
            claims.extend(op_ids.iter().map(|&o| {
                Claim::new(ops[o].demand, 0.0, input.operations[ops[o].input].weight)
            }));
            let shares = weighted_fill(available, &claims);
            for (&c, share) in children.iter().zip(&shares) {
                pools[c].fair = *share;
            }
            for (&o, share) in op_ids.iter().zip(&shares[children.len()..]) {
                ops[o].fair = *share;
            }
        }
        stack.extend(children);
    }
}

/// Zero fifo shares that cannot start what the operation needs: gang
/// operations need their whole demand, others one job. Returns true if a
/// pool's share shrank and the tree must be refilled.
fn truncate_fifo(pools: &mut [PoolNode], ops: &mut [OpNode], input: &UpdateInput<'_>) -> bool {
    let mut changed = false;
    for p in 0..pools.len() {
        if pools[p].kind != PoolKind::FifoInner {
            continue;
        }
        let mut freed = 0.0;
        for &o in &pools[p].ops {
            let op = &mut ops[o];
            let threshold = if input.operations[op.input].is_gang {
                op.demand
            } else {
                op.min_needed.min(op.demand)
            };
            if op.fair > EPSILON && op.fair < threshold - EPSILON {
                freed += op.fair;
                op.fair = 0.0;
                op.truncated = true;
            }
        }
        if freed > EPSILON {
            pools[p].cap = (pools[p].fair - freed).max(0.0);
            changed = true;
        }
    }
    changed
}

fn inherit_starvation_settings(tree: &PoolTree, pools: &mut [PoolNode], config: &PoolTreeConfig) {
    let mut stack = vec![0usize];
    pools[0].tolerance = config.fair_share_starvation_tolerance;
    pools[0].timeout_ms = config.fair_share_starvation_timeout_ms;
    while let Some(p) = stack.pop() {
        let parent = tree.pool(&pools[p].name);
        let limit = parent
            .and_then(|pool| pool.config.fair_share_starvation_tolerance_limit)
            .unwrap_or(1.0);
        let (tolerance, timeout) = (pools[p].tolerance, pools[p].timeout_ms);
        for c in pools[p].children.clone() {
            let own = tree.pool(&pools[c].name).map(|pool| &pool.config);
            pools[c].tolerance = own
                .and_then(|cfg| cfg.fair_share_starvation_tolerance)
                .unwrap_or(tolerance)
                .min(limit);
            pools[c].timeout_ms = own
                .and_then(|cfg| cfg.fair_share_starvation_timeout_ms)
                .unwrap_or(timeout);
            stack.push(c);
        }
    }
}

fn integral_info(tree: &PoolTree, name: &str, total: &ResourceVector, config: &PoolTreeConfig) -> IntegralInfo {
    let saturation = config.integral_guarantees.saturation_period_secs();
    let mut flow_total = 0.0;
    let mut burst_total = 0.0;
    for pool in tree.pools().filter(|p| p.kind.accrues_volume() && tree.is_in_subtree(&p.name, name)) {
        let ig = &pool.config.integral_guarantees;
        flow_total += ig.resource_flow.dominant(total);
        burst_total += ig.burst_guarantee_resources.dominant(total);
    }
    let (ig, volume) = match tree.pool(name) {
        Some(pool) => (
            pool.config.integral_guarantees.clone(),
            pool.state.integral_volume.clone(),
        ),
        None => Default::default(),
    };
    IntegralInfo {
        guarantee_type: ig.guarantee_type,
        integral_pool_capacity: ig.resource_flow.scale(saturation),
        accumulated_resource_ratio_volume: volume.dominant(total),
        accumulated_resource_volume: volume,
        specified_resource_flow_ratio: ig.resource_flow.dominant(total),
        specified_burst_ratio: ig.burst_guarantee_resources.dominant(total),
        total_resource_flow_ratio: flow_total,
        total_burst_ratio: burst_total,
    }
}

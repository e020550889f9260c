//! Results of a fair-share update.

use std::collections::BTreeMap;

use serde::Serialize;

use tessera_core::{Millis, OperationId, ResourceVector};
use tessera_pools::{IntegralGuaranteeType, PoolKind, SchedulingMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StarvationStatus {
    #[default]
    NonStarving,
    Starving,
    AggressivelyStarving,
}

impl StarvationStatus {
    pub fn is_starving(self) -> bool {
        self != StarvationStatus::NonStarving
    }
}

/// Fair share split by where it came from. All values are dominant
/// shares of the tree total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DetailedFairShare {
    pub strong_guarantee: f64,
    pub integral_guarantee: f64,
    pub weight_proportional: f64,
    pub total: f64,
}

impl DetailedFairShare {
    pub(crate) fn split(total: f64, strong: f64, integral: f64) -> Self {
        let strong = strong.clamp(0.0, total);
        let integral = integral.clamp(0.0, total - strong);
        Self {
            strong_guarantee: strong,
            integral_guarantee: integral,
            weight_proportional: (total - strong - integral).max(0.0),
            total,
        }
    }

    /// The same split applied to a part of the share.
    pub(crate) fn portion(&self, total: f64) -> Self {
        if self.total <= 0.0 {
            return Self::split(total, 0.0, 0.0);
        }
        let f = total / self.total;
        Self::split(total, self.strong_guarantee * f, self.integral_guarantee * f)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegralInfo {
    pub guarantee_type: IntegralGuaranteeType,
    pub integral_pool_capacity: ResourceVector,
    pub accumulated_resource_volume: ResourceVector,
    /// Volume as a dominant share of the total, in share·seconds.
    pub accumulated_resource_ratio_volume: f64,
    pub specified_resource_flow_ratio: f64,
    pub specified_burst_ratio: f64,
    /// Flow and burst ratios of this pool and its integral descendants.
    pub total_resource_flow_ratio: f64,
    pub total_burst_ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolShare {
    pub name: String,
    pub parent: Option<String>,
    pub kind: PoolKind,
    pub mode: SchedulingMode,
    pub is_ephemeral: bool,
    pub weight: f64,
    pub demand: ResourceVector,
    pub demand_ratio: f64,
    pub usage: ResourceVector,
    pub usage_ratio: f64,
    pub resource_limits: Option<ResourceVector>,
    pub strong_guarantee_share: f64,
    pub fair_share: DetailedFairShare,
    pub fair_share_resources: ResourceVector,
    pub satisfaction_ratio: f64,
    pub starvation_status: StarvationStatus,
    pub starvation_tolerance: f64,
    pub historic_usage: ResourceVector,
    pub operation_count: usize,
    pub integral: Option<IntegralInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationShare {
    pub id: OperationId,
    pub pool: String,
    pub weight: f64,
    pub demand: ResourceVector,
    pub demand_ratio: f64,
    pub usage: ResourceVector,
    pub usage_ratio: f64,
    pub min_needed_resources: ResourceVector,
    pub min_needed_ratio: f64,
    pub fair_share: DetailedFairShare,
    pub fair_share_resources: ResourceVector,
    pub satisfaction_ratio: f64,
    pub starvation_status: StarvationStatus,
    pub starvation_tolerance: f64,
    pub below_fair_share_since: Option<Millis>,
    pub min_needed_unsatisfied_count: u64,
    /// Share taken away by fifo truncation.
    pub truncated: bool,
}

/// Everything one update computed for one tree.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TreeShares {
    pub tree: String,
    pub snapshot_id: u64,
    pub taken_at: Millis,
    pub total_resources: ResourceVector,
    pub pools: BTreeMap<String, PoolShare>,
    pub operations: BTreeMap<OperationId, OperationShare>,
    /// Operations naming a pool the tree no longer has.
    pub unresolved_operations: Vec<OperationId>,
}

impl TreeShares {
    pub fn pool(&self, name: &str) -> Option<&PoolShare> {
        self.pools.get(name)
    }

    pub fn operation(&self, id: OperationId) -> Option<&OperationShare> {
        self.operations.get(&id)
    }

    pub fn starving_operations(&self) -> Vec<&OperationShare> {
        self.operations
            .values()
            .filter(|op| op.starvation_status.is_starving())
            .collect()
    }
}

//! Integral volume accounting.
//!
//! Every pool with a resource flow accrues `flow·Δ` of volume per tick and
//! spends what its integral share actually granted. Volume is clamped to
//! `[0, flow · saturation period]`; with
//! `should_distribute_free_volume_among_children` the overflow of a full
//! pool is handed to integral descendants that accept free volume,
//! proportionally to their flow.
//!
//! Burst and relaxed pools turn volume into share: `volume / smooth period`
//! bounds what they may take in a tick.

use std::collections::BTreeMap;

use tracing::debug;

use tessera_core::{IntegralGuaranteesTreeConfig, ResourceVector};
use tessera_pools::{IntegralGuaranteeType, PoolKind, PoolTree};

use crate::distribute::capped_fill;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntegralSettings {
    pub smooth_period_secs: f64,
    pub saturation_period_secs: f64,
    pub relaxed_share_multiplier_limit: f64,
    pub distribute_free_volume: bool,
}

impl IntegralSettings {
    pub fn new(config: &IntegralGuaranteesTreeConfig, distribute_free_volume: bool) -> Self {
        Self {
            smooth_period_secs: config.smooth_period_secs(),
            saturation_period_secs: config.saturation_period_secs(),
            relaxed_share_multiplier_limit: config.relaxed_share_multiplier_limit,
            distribute_free_volume,
        }
    }
}

fn restrict_to(v: &ResourceVector, names: &ResourceVector) -> ResourceVector {
    ResourceVector::from_pairs(names.names().map(|n| (n, v.get(n))))
}

/// Advance every accruing pool's volume by `dt_secs`.
///
/// `last_grants` holds the integral share each pool was granted by the
/// previous update; that share is what the pool spent meanwhile.
pub fn accrue_volumes(
    tree: &mut PoolTree,
    total: &ResourceVector,
    last_grants: &BTreeMap<String, f64>,
    dt_secs: f64,
    settings: &IntegralSettings,
) {
    if dt_secs <= 0.0 {
        return;
    }
    let accruing: Vec<(String, ResourceVector, bool)> = tree
        .pools()
        .filter(|p| p.kind.accrues_volume())
        .map(|p| {
            let ig = &p.config.integral_guarantees;
            (p.name.clone(), ig.resource_flow.clone(), ig.can_accept_free_volume)
        })
        .collect();

    let mut overflow = Vec::new();
    for (name, flow, _) in &accruing {
        let capacity = flow.scale(settings.saturation_period_secs);
        let granted = last_grants.get(name).copied().unwrap_or(0.0);
        let spent = restrict_to(&total.scale(granted * dt_secs), flow);
        let Some(state) = tree.state_mut(name) else {
            continue;
        };
        let raw = state
            .integral_volume
            .add(&flow.scale(dt_secs))
            .sub_saturating(&spent);
        let excess = raw.sub_saturating(&capacity);
        state.integral_volume = raw.min(&capacity);
        if settings.distribute_free_volume && !excess.is_zero() {
            overflow.push((name.clone(), excess));
        }
    }

    for (source, excess) in overflow {
        let acceptors: Vec<(&String, &ResourceVector)> = accruing
            .iter()
            .filter(|(name, _, accepts)| *accepts && *name != source && tree.is_in_subtree(name, &source))
            .map(|(name, flow, _)| (name, flow))
            .collect();
        let weights: Vec<f64> = acceptors.iter().map(|(_, flow)| flow.dominant(total)).collect();
        let weight_sum: f64 = weights.iter().sum();
        if weight_sum <= 0.0 {
            continue;
        }
        let updates: Vec<(String, ResourceVector)> = acceptors
            .iter()
            .zip(&weights)
            .map(|((name, flow), w)| {
                let capacity = flow.scale(settings.saturation_period_secs);
                ((*name).clone(), excess.scale(w / weight_sum), capacity)
            })
            .filter_map(|(name, share, capacity)| {
                let volume = tree.pool(&name)?.state.integral_volume.add(&share);
                Some((name, volume.min(&capacity)))
            })
            .collect();
        for (name, volume) in updates {
            if let Some(state) = tree.state_mut(&name) {
                state.integral_volume = volume;
            }
        }
        debug!(tree = tree.name(), pool = %source, "free volume distributed among descendants");
    }
}

/// Burst and relaxed pools that take part in the integral pass: integral
/// pools reached from the root through pools without their own guarantee.
pub fn guarantee_pools(tree: &PoolTree) -> Vec<String> {
    let mut found = Vec::new();
    let mut stack = vec![tree.root().name.clone()];
    while let Some(name) = stack.pop() {
        for child in tree.children(&name).into_iter().rev() {
            let kind = child.config.integral_guarantees.guarantee_type;
            if child.kind == PoolKind::IntegralInner && kind != IntegralGuaranteeType::None {
                found.push(child.name.clone());
            } else {
                stack.push(child.name.clone());
            }
        }
    }
    found
}

/// Inputs of one pool to the integral pass, as dominant shares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntegralClaim {
    /// Accumulated volume in share·seconds.
    pub volume_ratio: f64,
    pub flow_ratio: f64,
    pub burst_ratio: f64,
    pub demand: f64,
    /// Strong guarantee already covering part of the demand.
    pub strong: f64,
}

/// Share granted to a burst pool on top of its strong guarantee.
pub fn burst_grant(claim: &IntegralClaim, settings: &IntegralSettings) -> f64 {
    let bound = claim
        .burst_ratio
        .min(claim.volume_ratio / settings.smooth_period_secs)
        .min(claim.demand);
    (bound - claim.strong.min(claim.demand)).max(0.0)
}

/// Split `available` among relaxed pools, weighted by their volume.
pub fn relaxed_grants(available: f64, claims: &[IntegralClaim], settings: &IntegralSettings) -> Vec<f64> {
    let caps: Vec<f64> = claims
        .iter()
        .map(|c| {
            let bound = (c.volume_ratio / settings.smooth_period_secs)
                .min(c.flow_ratio * settings.relaxed_share_multiplier_limit)
                .min(c.demand);
            (bound - c.strong.min(c.demand)).max(0.0)
        })
        .collect();
    let weights: Vec<f64> = claims.iter().map(|c| c.volume_ratio).collect();
    capped_fill(available, &caps, &weights)
}

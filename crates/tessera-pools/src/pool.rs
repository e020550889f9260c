//! Pools and their configuration.

use serde::{Deserialize, Serialize};

use tessera_core::{Acl, Millis, Permission, ResourceVector};
use tessera_state::PoolStateRecord;

use crate::error::{PoolError, PoolResult};

/// Characters reserved for internal pool names (`parent$user` subpools).
const RESERVED_CHARS: [char; 2] = ['$', '|'];
const MAX_POOL_NAME_LEN: usize = 100;

/// Check a user-supplied pool name.
pub fn validate_pool_name(name: &str) -> PoolResult<()> {
    if name.is_empty() {
        return Err(PoolError::Configuration("pool name must not be empty".into()));
    }
    if name.len() > MAX_POOL_NAME_LEN {
        return Err(PoolError::Configuration(format!(
            "pool name {name:?} is longer than {MAX_POOL_NAME_LEN} characters"
        )));
    }
    if let Some(c) = name.chars().find(|c| RESERVED_CHARS.contains(c) || c.is_control()) {
        return Err(PoolError::Configuration(format!(
            "pool name {name:?} contains forbidden character {c:?}"
        )));
    }
    if name == tessera_core::ROOT_POOL_NAME {
        return Err(PoolError::Configuration(format!("pool name {name:?} is reserved")));
    }
    Ok(())
}

/// Name of the per-user subpool of a pool with `create_ephemeral_subpools`.
pub fn ephemeral_subpool_name(parent: &str, user: &str) -> String {
    format!("{parent}${user}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    #[default]
    FairShare,
    Fifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegralGuaranteeType {
    #[default]
    None,
    Burst,
    Relaxed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegralGuarantees {
    pub guarantee_type: IntegralGuaranteeType,
    pub resource_flow: ResourceVector,
    pub burst_guarantee_resources: ResourceVector,
    pub can_accept_free_volume: bool,
}

impl Default for IntegralGuarantees {
    fn default() -> Self {
        Self {
            guarantee_type: IntegralGuaranteeType::None,
            resource_flow: ResourceVector::zero(),
            burst_guarantee_resources: ResourceVector::zero(),
            can_accept_free_volume: true,
        }
    }
}

impl IntegralGuarantees {
    pub fn burst(flow: ResourceVector, burst: ResourceVector) -> Self {
        Self {
            guarantee_type: IntegralGuaranteeType::Burst,
            resource_flow: flow,
            burst_guarantee_resources: burst,
            ..Self::default()
        }
    }

    pub fn relaxed(flow: ResourceVector) -> Self {
        Self {
            guarantee_type: IntegralGuaranteeType::Relaxed,
            resource_flow: flow,
            ..Self::default()
        }
    }

    /// True when the pool accrues volume at all.
    pub fn is_active(&self) -> bool {
        self.guarantee_type != IntegralGuaranteeType::None || !self.resource_flow.is_zero()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoricUsageAggregationMode {
    #[default]
    None,
    ExponentialMovingAverage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoricUsageConfig {
    pub aggregation_mode: HistoricUsageAggregationMode,
    /// Overrides the scheduler-wide `historic_usage_ema_alpha`.
    pub ema_alpha: Option<f64>,
}

/// Template for the per-user subpools of a pool with `create_ephemeral_subpools`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EphemeralSubpoolConfig {
    pub mode: SchedulingMode,
    pub max_operation_count: Option<usize>,
    pub max_running_operation_count: Option<usize>,
    pub resource_limits: Option<ResourceVector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub mode: SchedulingMode,
    pub weight: Option<f64>,
    #[serde(alias = "min_share_resources")]
    pub strong_guarantee_resources: Option<ResourceVector>,
    pub integral_guarantees: IntegralGuarantees,
    pub resource_limits: Option<ResourceVector>,
    pub max_operation_count: Option<usize>,
    pub max_running_operation_count: Option<usize>,
    pub acl: Acl,
    pub create_ephemeral_subpools: bool,
    pub ephemeral_subpool_config: Option<EphemeralSubpoolConfig>,
    pub forbid_immediate_operations: bool,
    pub historic_usage_config: HistoricUsageConfig,
    pub fair_share_starvation_tolerance: Option<f64>,
    /// Cap on the tolerance inherited by descendants.
    pub fair_share_starvation_tolerance_limit: Option<f64>,
    pub fair_share_starvation_timeout_ms: Option<u64>,
    pub allow_aggressive_starvation_preemption: Option<bool>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            mode: SchedulingMode::FairShare,
            weight: None,
            strong_guarantee_resources: None,
            integral_guarantees: IntegralGuarantees::default(),
            resource_limits: None,
            max_operation_count: None,
            max_running_operation_count: None,
            acl: Acl::default(),
            create_ephemeral_subpools: false,
            ephemeral_subpool_config: None,
            forbid_immediate_operations: false,
            historic_usage_config: HistoricUsageConfig::default(),
            fair_share_starvation_tolerance: None,
            fair_share_starvation_tolerance_limit: None,
            fair_share_starvation_timeout_ms: None,
            allow_aggressive_starvation_preemption: None,
        }
    }
}

impl PoolConfig {
    pub fn fifo() -> Self {
        Self {
            mode: SchedulingMode::Fifo,
            ..Self::default()
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_strong_guarantee(mut self, resources: ResourceVector) -> Self {
        self.strong_guarantee_resources = Some(resources);
        self
    }

    pub fn with_integral_guarantees(mut self, guarantees: IntegralGuarantees) -> Self {
        self.integral_guarantees = guarantees;
        self
    }

    pub fn with_resource_limits(mut self, limits: ResourceVector) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    pub fn with_acl(mut self, acl: Acl) -> Self {
        self.acl = acl;
        self
    }

    pub fn with_max_running_operation_count(mut self, count: usize) -> Self {
        self.max_running_operation_count = Some(count);
        self
    }

    pub fn with_max_operation_count(mut self, count: usize) -> Self {
        self.max_operation_count = Some(count);
        self
    }

    pub fn validate(&self) -> PoolResult<()> {
        if let Some(w) = self.weight
            && !(w.is_finite() && w > 0.0)
        {
            return Err(PoolError::Configuration(format!("pool weight must be positive, got {w}")));
        }
        if self.mode == SchedulingMode::Fifo && self.create_ephemeral_subpools {
            return Err(PoolError::Configuration(
                "fifo pools cannot create ephemeral subpools".into(),
            ));
        }
        if self.mode == SchedulingMode::Fifo && self.integral_guarantees.is_active() {
            return Err(PoolError::Configuration(
                "integral guarantees are not supported for fifo pools".into(),
            ));
        }
        let integral = &self.integral_guarantees;
        match integral.guarantee_type {
            IntegralGuaranteeType::Burst if integral.burst_guarantee_resources.is_zero() => {
                return Err(PoolError::Configuration(
                    "burst pools need non-zero burst_guarantee_resources".into(),
                ));
            }
            IntegralGuaranteeType::Burst | IntegralGuaranteeType::Relaxed
                if integral.resource_flow.is_zero() =>
            {
                return Err(PoolError::Configuration(
                    "integral pools need a non-zero resource_flow".into(),
                ));
            }
            _ => {}
        }
        for (name, value) in [
            ("fair_share_starvation_tolerance", self.fair_share_starvation_tolerance),
            ("fair_share_starvation_tolerance_limit", self.fair_share_starvation_tolerance_limit),
        ] {
            if let Some(v) = value
                && !(v > 0.0 && v <= 1.0)
            {
                return Err(PoolError::Configuration(format!("{name} must be in (0, 1], got {v}")));
            }
        }
        if let Some(alpha) = self.historic_usage_config.ema_alpha
            && !(0.0..=1.0).contains(&alpha)
        {
            return Err(PoolError::Configuration(format!("ema_alpha must be in [0, 1], got {alpha}")));
        }
        Ok(())
    }

    pub(crate) fn for_ephemeral_subpool(template: Option<&EphemeralSubpoolConfig>) -> Self {
        let template = template.cloned().unwrap_or_default();
        Self {
            mode: template.mode,
            max_operation_count: template.max_operation_count,
            max_running_operation_count: template.max_running_operation_count,
            resource_limits: template.resource_limits,
            ..Self::default()
        }
    }
}

/// How the fair-share engine treats a pool.
///
/// The kind is derived from the configuration; it decides how the share
/// is split among children, which operations are offered for scheduling,
/// and whether the pool takes part in volume accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    Root,
    Inner,
    FifoInner,
    IntegralInner,
}

impl PoolKind {
    pub fn of(is_root: bool, config: &PoolConfig) -> Self {
        if is_root {
            PoolKind::Root
        } else if config.mode == SchedulingMode::Fifo {
            PoolKind::FifoInner
        } else if config.integral_guarantees.is_active() {
            PoolKind::IntegralInner
        } else {
            PoolKind::Inner
        }
    }

    /// Fifo pools offer operations in submit order instead of by satisfaction.
    pub fn orders_by_submit_time(self) -> bool {
        self == PoolKind::FifoInner
    }

    pub fn accrues_volume(self) -> bool {
        self == PoolKind::IntegralInner
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Pool {
    pub name: String,
    pub parent: Option<String>,
    pub config: PoolConfig,
    pub kind: PoolKind,
    pub is_ephemeral: bool,
    /// Owner of an ephemeral pool.
    pub user_name: Option<String>,
    pub state: PoolStateRecord,
    pub created_at: Millis,
}

impl Pool {
    pub(crate) fn new(name: &str, parent: Option<&str>, config: PoolConfig, now: Millis) -> Self {
        let kind = PoolKind::of(parent.is_none(), &config);
        Self {
            name: name.to_string(),
            parent: parent.map(str::to_string),
            config,
            kind,
            is_ephemeral: false,
            user_name: None,
            state: PoolStateRecord::default(),
            created_at: now,
        }
    }

    pub fn is_root(&self) -> bool {
        self.kind == PoolKind::Root
    }

    pub fn weight(&self) -> f64 {
        self.config.weight.unwrap_or(1.0)
    }

    pub(crate) fn set_config(&mut self, config: PoolConfig) {
        self.kind = PoolKind::of(self.parent.is_none(), &config);
        self.config = config;
    }

    pub(crate) fn root_acl() -> Acl {
        Acl::open(&[Permission::Use])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_names_reject_reserved_characters() {
        validate_pool_name("research").unwrap();
        validate_pool_name("team-a.batch").unwrap();
        for bad in ["", "a$b", "a|b", "<Root>"] {
            assert!(validate_pool_name(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn fifo_with_ephemeral_subpools_is_rejected() {
        let config = PoolConfig {
            create_ephemeral_subpools: true,
            ..PoolConfig::fifo()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), tessera_core::ErrorKind::Configuration);
    }

    #[test]
    fn kind_follows_configuration() {
        let burst = PoolConfig::default().with_integral_guarantees(IntegralGuarantees::burst(
            ResourceVector::cpu(6.0),
            ResourceVector::cpu(6.0),
        ));
        assert_eq!(PoolKind::of(false, &burst), PoolKind::IntegralInner);
        assert_eq!(PoolKind::of(false, &PoolConfig::fifo()), PoolKind::FifoInner);
        assert_eq!(PoolKind::of(false, &PoolConfig::default()), PoolKind::Inner);
        assert_eq!(PoolKind::of(true, &PoolConfig::fifo()), PoolKind::Root);
    }

    #[test]
    fn burst_pool_without_burst_resources_is_rejected() {
        let config = PoolConfig::default().with_integral_guarantees(IntegralGuarantees {
            guarantee_type: IntegralGuaranteeType::Burst,
            resource_flow: ResourceVector::cpu(1.0),
            ..IntegralGuarantees::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_accepts_legacy_min_share_name() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"min_share_resources": {"cpu": 3.0}, "weight": 2.0}"#).unwrap();
        assert_eq!(config.strong_guarantee_resources, Some(ResourceVector::cpu(3.0)));
        assert_eq!(config.weight, Some(2.0));
    }
}

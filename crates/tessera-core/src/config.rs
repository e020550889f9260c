//! tessera.toml configuration.
//!
//! Every field has a default so a partial (or empty) file is valid. Periods
//! and timeouts are stored in milliseconds and read back as [`Duration`]
//! through accessor methods.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resources::ResourceVector;
use crate::tags::TagFilter;

/// Name of the root pool of every pool tree.
pub const ROOT_POOL_NAME: &str = "<Root>";

/// Operation kinds with their own spec template slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Map,
    Reduce,
    MapReduce,
    Sort,
    Merge,
    Erase,
    Vanilla,
    RemoteCopy,
}

/// Top-level dynamic configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    pub fair_share_update_period_ms: u64,
    pub watchers_update_period_ms: u64,
    pub min_spare_job_resources_on_node: Option<ResourceVector>,
    pub soft_concurrent_heartbeat_limit: usize,
    pub hard_concurrent_heartbeat_limit: usize,
    pub node_heartbeat_processing_delay_ms: u64,
    pub event_log: EventLogConfig,
    pub operation_options: OperationOptions,
    pub map_operation_options: Option<OperationOptions>,
    pub reduce_operation_options: Option<OperationOptions>,
    pub map_reduce_operation_options: Option<OperationOptions>,
    pub sort_operation_options: Option<OperationOptions>,
    pub merge_operation_options: Option<OperationOptions>,
    pub erase_operation_options: Option<OperationOptions>,
    pub vanilla_operation_options: Option<OperationOptions>,
    pub remote_copy_operation_options: Option<OperationOptions>,
    pub tablet_manager: TabletManagerConfig,
    pub enable_safe_mode: bool,
    pub scheduler: SchedulerConfig,
    pub default_pool_tree: String,
    pub pool_trees: BTreeMap<String, PoolTreeConfig>,
}

impl Default for TesseraConfig {
    fn default() -> Self {
        let mut pool_trees = BTreeMap::new();
        pool_trees.insert("default".to_string(), PoolTreeConfig::default());
        Self {
            fair_share_update_period_ms: 100,
            watchers_update_period_ms: 100,
            min_spare_job_resources_on_node: None,
            soft_concurrent_heartbeat_limit: 50,
            hard_concurrent_heartbeat_limit: 100,
            node_heartbeat_processing_delay_ms: 0,
            event_log: EventLogConfig::default(),
            operation_options: OperationOptions::default(),
            map_operation_options: None,
            reduce_operation_options: None,
            map_reduce_operation_options: None,
            sort_operation_options: None,
            merge_operation_options: None,
            erase_operation_options: None,
            vanilla_operation_options: None,
            remote_copy_operation_options: None,
            tablet_manager: TabletManagerConfig::default(),
            enable_safe_mode: false,
            scheduler: SchedulerConfig::default(),
            default_pool_tree: "default".to_string(),
            pool_trees,
        }
    }
}

impl TesseraConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: TesseraConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn fair_share_update_period(&self) -> Duration {
        Duration::from_millis(self.fair_share_update_period_ms)
    }

    pub fn watchers_update_period(&self) -> Duration {
        Duration::from_millis(self.watchers_update_period_ms)
    }

    pub fn node_heartbeat_processing_delay(&self) -> Duration {
        Duration::from_millis(self.node_heartbeat_processing_delay_ms)
    }

    /// Per-kind options, if configured.
    pub fn kind_options(&self, kind: OperationKind) -> Option<&OperationOptions> {
        match kind {
            OperationKind::Map => self.map_operation_options.as_ref(),
            OperationKind::Reduce => self.reduce_operation_options.as_ref(),
            OperationKind::MapReduce => self.map_reduce_operation_options.as_ref(),
            OperationKind::Sort => self.sort_operation_options.as_ref(),
            OperationKind::Merge => self.merge_operation_options.as_ref(),
            OperationKind::Erase => self.erase_operation_options.as_ref(),
            OperationKind::Vanilla => self.vanilla_operation_options.as_ref(),
            OperationKind::RemoteCopy => self.remote_copy_operation_options.as_ref(),
        }
    }

    /// Merge the general and per-kind spec templates under `user_spec`.
    ///
    /// User keys win over the kind template, which wins over the general
    /// template. Nested objects merge recursively.
    pub fn effective_spec(&self, kind: OperationKind, user_spec: &Value) -> Value {
        let mut spec = self.operation_options.spec_template.clone();
        if let Some(opts) = self.kind_options(kind) {
            merge_json(&mut spec, &opts.spec_template);
        }
        merge_json(&mut spec, user_spec);
        spec
    }

    pub fn pool_tree(&self, name: &str) -> PoolTreeConfig {
        self.pool_trees.get(name).cloned().unwrap_or_default()
    }
}

/// Recursively merge `patch` into `base`. Non-object values replace.
pub fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                match base_map.get_mut(k) {
                    Some(existing) => merge_json(existing, v),
                    None => {
                        base_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (base, Value::Null) if !base.is_null() => {}
        (base, patch) => *base = patch.clone(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationOptions {
    pub spec_template: Value,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            spec_template: Value::Object(Default::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    pub enabled: bool,
    pub path: Option<PathBuf>,
    pub flush_period_ms: u64,
    pub retry_backoff_time_ms: u64,
    pub max_event_log_operation_batch_size: usize,
    /// Period of `accumulated_usage_info` records.
    pub accumulated_usage_log_period_ms: u64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            flush_period_ms: 5_000,
            retry_backoff_time_ms: 1_000,
            max_event_log_operation_batch_size: 100,
            accumulated_usage_log_period_ms: 60_000,
        }
    }
}

impl EventLogConfig {
    pub fn flush_period(&self) -> Duration {
        Duration::from_millis(self.flush_period_ms)
    }
}

// ── Tablet manager ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletManagerConfig {
    pub leader_reassignment_timeout_ms: u64,
    pub peer_revocation_timeout_ms: u64,
    pub decommission_through_extra_peers: bool,
    pub decommissioned_leader_reassignment_timeout_ms: u64,
    pub extra_peer_drop_delay_ms: u64,
    pub balancer_tick_period_ms: u64,
    /// Tablet slots assumed for nodes that do not report a count.
    pub default_tablet_slot_count: usize,
    pub tablet_cell_decommissioner: TabletCellDecommissionerConfig,
    pub tablet_cell_balancer: TabletCellBalancerConfig,
}

impl Default for TabletManagerConfig {
    fn default() -> Self {
        Self {
            leader_reassignment_timeout_ms: 15_000,
            peer_revocation_timeout_ms: 60_000,
            decommission_through_extra_peers: false,
            decommissioned_leader_reassignment_timeout_ms: 15_000,
            extra_peer_drop_delay_ms: 10_000,
            balancer_tick_period_ms: 100,
            default_tablet_slot_count: 4,
            tablet_cell_decommissioner: TabletCellDecommissionerConfig::default(),
            tablet_cell_balancer: TabletCellBalancerConfig::default(),
        }
    }
}

impl TabletManagerConfig {
    pub fn balancer_tick_period(&self) -> Duration {
        Duration::from_millis(self.balancer_tick_period_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletCellDecommissionerConfig {
    pub enable_tablet_cell_removal: bool,
    pub enable_tablet_cell_decommission: bool,
    pub decommission_check_period_ms: u64,
    pub orphans_check_period_ms: u64,
}

impl Default for TabletCellDecommissionerConfig {
    fn default() -> Self {
        Self {
            enable_tablet_cell_removal: true,
            enable_tablet_cell_decommission: true,
            decommission_check_period_ms: 1_000,
            orphans_check_period_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletCellBalancerConfig {
    pub enable_tablet_cell_balancer: bool,
    pub rebalance_wait_time_ms: u64,
}

impl Default for TabletCellBalancerConfig {
    fn default() -> Self {
        Self {
            enable_tablet_cell_balancer: true,
            rebalance_wait_time_ms: 60_000,
        }
    }
}

// ── Scheduler ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub node_heartbeat_timeout_ms: u64,
    pub operation_hangup_check_period_ms: u64,
    pub operation_hangup_safe_timeout_ms: u64,
    pub operation_hangup_min_schedule_job_attempts: u64,
    pub operation_hangup_due_to_limiting_ancestor_safe_timeout_ms: u64,
    pub suspicious_inactivity_timeout_ms: u64,
    pub job_graceful_interrupt_timeout_ms: u64,
    pub allowed_node_resources_overcommit_duration_ms: u64,
    pub historic_usage_ema_alpha: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_heartbeat_timeout_ms: 60_000,
            operation_hangup_check_period_ms: 1_000,
            operation_hangup_safe_timeout_ms: 30 * 60_000,
            operation_hangup_min_schedule_job_attempts: 100,
            operation_hangup_due_to_limiting_ancestor_safe_timeout_ms: 5 * 60_000,
            suspicious_inactivity_timeout_ms: 60_000,
            job_graceful_interrupt_timeout_ms: 60_000,
            allowed_node_resources_overcommit_duration_ms: 10_000,
            historic_usage_ema_alpha: 0.1,
        }
    }
}

// ── Pool trees ─────────────────────────────────────────────────

/// Per-tree tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolTreeConfig {
    pub nodes_filter: TagFilter,
    pub default_parent_pool: String,
    pub max_ephemeral_pools_per_user: usize,
    pub max_running_operation_count: usize,
    pub max_running_operation_count_per_pool: usize,
    pub max_operation_count: usize,
    pub max_operation_count_per_pool: usize,
    pub fair_share_starvation_tolerance: f64,
    pub aggressive_starvation_tolerance: f64,
    #[serde(alias = "fair_share_preemption_timeout_ms")]
    pub fair_share_starvation_timeout_ms: u64,
    #[serde(alias = "min_share_preemption_timeout_ms")]
    pub min_share_starvation_timeout_ms: u64,
    pub fair_share_aggressive_starvation_timeout_ms: u64,
    pub preemption_satisfaction_threshold: f64,
    pub aggressive_preemption_satisfaction_threshold: f64,
    pub max_unpreemptable_running_job_count: usize,
    pub enable_limiting_ancestor_check: bool,
    pub enable_operation_hangup_check: bool,
    pub enable_fair_share_truncation_in_fifo_pool: bool,
    pub should_distribute_free_volume_among_children: bool,
    #[serde(alias = "infer_weight_from_strong_guarantee_share_multiplier")]
    pub infer_weight_from_min_share_ratio_multiplier: Option<f64>,
    pub integral_guarantees: IntegralGuaranteesTreeConfig,
}

impl Default for PoolTreeConfig {
    fn default() -> Self {
        Self {
            nodes_filter: TagFilter::any(),
            default_parent_pool: ROOT_POOL_NAME.to_string(),
            max_ephemeral_pools_per_user: 1,
            max_running_operation_count: 200,
            max_running_operation_count_per_pool: 50,
            max_operation_count: 1_000,
            max_operation_count_per_pool: 50,
            fair_share_starvation_tolerance: 0.8,
            aggressive_starvation_tolerance: 0.5,
            fair_share_starvation_timeout_ms: 30_000,
            min_share_starvation_timeout_ms: 15_000,
            fair_share_aggressive_starvation_timeout_ms: 120_000,
            preemption_satisfaction_threshold: 1.0,
            aggressive_preemption_satisfaction_threshold: 0.5,
            max_unpreemptable_running_job_count: 10,
            enable_limiting_ancestor_check: true,
            enable_operation_hangup_check: true,
            enable_fair_share_truncation_in_fifo_pool: false,
            should_distribute_free_volume_among_children: false,
            infer_weight_from_min_share_ratio_multiplier: None,
            integral_guarantees: IntegralGuaranteesTreeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegralGuaranteesTreeConfig {
    /// Volume is converted to share by dividing by this period.
    pub smooth_period_ms: u64,
    /// Relaxed pools never get more than `flow × limit`.
    pub relaxed_share_multiplier_limit: f64,
    /// Volume capacity is `flow × saturation period`.
    pub pool_capacity_saturation_period_ms: u64,
}

impl Default for IntegralGuaranteesTreeConfig {
    fn default() -> Self {
        Self {
            smooth_period_ms: 60_000,
            relaxed_share_multiplier_limit: 3.0,
            pool_capacity_saturation_period_ms: 86_400_000,
        }
    }
}

impl IntegralGuaranteesTreeConfig {
    pub fn smooth_period_secs(&self) -> f64 {
        (self.smooth_period_ms as f64 / 1000.0).max(f64::MIN_POSITIVE)
    }

    pub fn saturation_period_secs(&self) -> f64 {
        self.pool_capacity_saturation_period_ms as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_file_yields_defaults() {
        let config = TesseraConfig::from_toml_str("").unwrap();
        assert_eq!(config.soft_concurrent_heartbeat_limit, 50);
        assert_eq!(config.hard_concurrent_heartbeat_limit, 100);
        assert!(!config.enable_safe_mode);
        assert_eq!(config.pool_tree("default").default_parent_pool, ROOT_POOL_NAME);
    }

    #[test]
    fn nested_tables_parse() {
        let toml = r#"
            enable_safe_mode = true

            [tablet_manager]
            decommission_through_extra_peers = true
            extra_peer_drop_delay_ms = 2000

            [tablet_manager.tablet_cell_balancer]
            enable_tablet_cell_balancer = false

            [pool_trees.default]
            fair_share_preemption_timeout_ms = 1000
            enable_limiting_ancestor_check = false
            nodes_filter = "!gpu"
        "#;
        let config = TesseraConfig::from_toml_str(toml).unwrap();
        assert!(config.enable_safe_mode);
        assert!(config.tablet_manager.decommission_through_extra_peers);
        assert_eq!(config.tablet_manager.extra_peer_drop_delay_ms, 2000);
        assert!(!config.tablet_manager.tablet_cell_balancer.enable_tablet_cell_balancer);
        let tree = config.pool_tree("default");
        assert_eq!(tree.fair_share_starvation_timeout_ms, 1000);
        assert!(!tree.enable_limiting_ancestor_check);
        assert_eq!(tree.nodes_filter.as_str(), "!gpu");
    }

    #[test]
    fn bad_tag_filter_fails_parse() {
        let toml = "[pool_trees.default]\nnodes_filter = \"a &\"\n";
        assert!(TesseraConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn kind_template_overrides_general_and_user_overrides_both() {
        let mut config = TesseraConfig::default();
        config.operation_options.spec_template = json!({"max_failed_job_count": 10, "data_weight_per_job": 1});
        config.vanilla_operation_options = Some(OperationOptions {
            spec_template: json!({"max_failed_job_count": 50, "tasks": {"a": {"job_count": 1}}}),
        });
        let spec = config.effective_spec(
            OperationKind::Vanilla,
            &json!({"data_weight_per_job": 7, "tasks": {"a": {"command": "sleep"}}}),
        );
        assert_eq!(spec["max_failed_job_count"], 50);
        assert_eq!(spec["data_weight_per_job"], 7);
        assert_eq!(spec["tasks"]["a"]["job_count"], 1);
        assert_eq!(spec["tasks"]["a"]["command"], "sleep");

        let map_spec = config.effective_spec(OperationKind::Map, &json!({}));
        assert_eq!(map_spec["max_failed_job_count"], 10);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut config = TesseraConfig::default();
        config.tablet_manager.peer_revocation_timeout_ms = 1234;
        let text = config.to_toml_string().unwrap();
        let back = TesseraConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.tablet_manager.peer_revocation_timeout_ms, 1234);
    }
}

//! Tablet cell bundles.

use serde::{Deserialize, Serialize};
use tessera_core::{Acl, BundleId, Millis, TagFilter};

use crate::accounts::{AccountLimits, AccountResources};

/// Static bundle options inherited by every cell of the bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleOptions {
    pub peer_count: usize,
    pub changelog_account: String,
    pub snapshot_account: String,
    pub changelog_replication_factor: u32,
    pub snapshot_replication_factor: u32,
    /// Erasure codec for snapshots, `none` to disable.
    pub snapshot_erasure_codec: String,
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            peer_count: 1,
            changelog_account: "sys".to_string(),
            snapshot_account: "sys".to_string(),
            changelog_replication_factor: 3,
            snapshot_replication_factor: 3,
            snapshot_erasure_codec: "none".to_string(),
        }
    }
}

/// Options that may change while cells are running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicBundleOptions {
    pub cpu_per_tablet_slot: Option<f64>,
    pub suppress_tablet_cell_decommission: bool,
    pub enable_tablet_cell_removal: Option<bool>,
}

/// Per-bundle balancer knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleBalancerConfig {
    pub enable_cell_balancer: bool,
    pub enable_tablet_balancer: bool,
}

impl Default for BundleBalancerConfig {
    fn default() -> Self {
        Self {
            enable_cell_balancer: true,
            enable_tablet_balancer: false,
        }
    }
}

/// Staged removal progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalState {
    #[default]
    None,
    RemovalStarted,
    RemovalPreCommitted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub id: BundleId,
    pub name: String,
    pub options: BundleOptions,
    pub dynamic_options: DynamicBundleOptions,
    pub node_tag_filter: TagFilter,
    pub balancer_config: BundleBalancerConfig,
    pub acl: Acl,
    pub removal: RemovalState,
    /// Tablet count and static memory caps across the bundle's tables.
    pub resource_limits: AccountLimits,
    pub resource_usage: AccountResources,
    /// Number of tables bound to the bundle.
    pub ref_count: usize,
    pub created_at: Millis,
}

impl Bundle {
    pub fn is_removing(&self) -> bool {
        self.removal != RemovalState::None
    }
}

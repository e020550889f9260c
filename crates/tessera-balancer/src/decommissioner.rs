//! Tablet cell decommissioner.
//!
//! Two periodic passes: the decommission check moves cells whose peers all
//! stopped from `decommissioning_on_node` to `decommissioned`, unless the
//! bundle sets `suppress_tablet_cell_decommission`; the orphans check
//! removes decommissioned cells when removal is enabled for their bundle.

use tracing::{debug, info};

use tessera_cells::{CellResult, CellStore, LifeStage};
use tessera_core::config::TabletCellDecommissionerConfig;
use tessera_core::{CellId, Millis};

use crate::events::{BalancerEvent, BalancerEventKind};

pub struct Decommissioner {
    config: TabletCellDecommissionerConfig,
    last_decommission_check: Option<Millis>,
    last_orphans_check: Option<Millis>,
}

fn due(last: Option<Millis>, period_ms: u64, now: Millis) -> bool {
    last.is_none_or(|t| now.saturating_sub(t) >= period_ms)
}

impl Decommissioner {
    pub fn new(config: TabletCellDecommissionerConfig) -> Self {
        Self {
            config,
            last_decommission_check: None,
            last_orphans_check: None,
        }
    }

    pub fn set_config(&mut self, config: TabletCellDecommissionerConfig) {
        self.config = config;
    }

    fn cells_in(store: &CellStore, stage: LifeStage) -> Vec<CellId> {
        store
            .cells()
            .filter(|c| c.life_stage == stage)
            .map(|c| c.id)
            .collect()
    }

    pub fn tick(&mut self, store: &mut CellStore, now: Millis) -> CellResult<Vec<BalancerEvent>> {
        let mut events = Vec::new();

        if due(self.last_decommission_check, self.config.decommission_check_period_ms, now) {
            self.last_decommission_check = Some(now);
            if self.config.enable_tablet_cell_decommission {
                for cell_id in Self::cells_in(store, LifeStage::DecommissioningOnNode) {
                    let suppressed = store
                        .cell(cell_id)
                        .and_then(|c| store.bundle(c.bundle_id))
                        .is_some_and(|b| b.dynamic_options.suppress_tablet_cell_decommission);
                    if suppressed {
                        debug!(%cell_id, "cell decommission suppressed by bundle");
                        continue;
                    }
                    if store.mark_decommissioned(cell_id)? {
                        events.push(BalancerEvent::new(cell_id, now, BalancerEventKind::CellDecommissioned));
                    }
                }
            }
        }

        if due(self.last_orphans_check, self.config.orphans_check_period_ms, now) {
            self.last_orphans_check = Some(now);
            for cell_id in Self::cells_in(store, LifeStage::Decommissioned) {
                let enabled = store
                    .cell(cell_id)
                    .and_then(|c| store.bundle(c.bundle_id))
                    .and_then(|b| b.dynamic_options.enable_tablet_cell_removal)
                    .unwrap_or(self.config.enable_tablet_cell_removal);
                if !enabled {
                    continue;
                }
                store.remove_cell(cell_id, true, now)?;
                info!(%cell_id, "decommissioned cell removed");
                events.push(BalancerEvent::new(cell_id, now, BalancerEventKind::CellRemoved));
            }
        }
        Ok(events)
    }
}

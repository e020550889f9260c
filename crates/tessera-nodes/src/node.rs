//! Node records.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tessera_core::resources::USER_SLOTS;
use tessera_core::{CellId, Millis, PeerState, ResourceVector};

/// Nodes tagged `segment:<name>` belong to scheduling segment `<name>`.
pub const SEGMENT_TAG_PREFIX: &str = "segment:";

/// Segment of nodes with no segment tag.
pub const DEFAULT_SEGMENT: &str = "default";

/// Administrative flags. Each one is set and observed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeFlag {
    Banned,
    Decommissioned,
    DisableTabletCells,
    DisableSchedulerJobs,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    pub banned: bool,
    pub decommissioned: bool,
    pub disable_tablet_cells: bool,
    pub disable_scheduler_jobs: bool,
}

impl NodeFlags {
    pub fn get(&self, flag: NodeFlag) -> bool {
        match flag {
            NodeFlag::Banned => self.banned,
            NodeFlag::Decommissioned => self.decommissioned,
            NodeFlag::DisableTabletCells => self.disable_tablet_cells,
            NodeFlag::DisableSchedulerJobs => self.disable_scheduler_jobs,
        }
    }

    pub fn set(&mut self, flag: NodeFlag, value: bool) {
        match flag {
            NodeFlag::Banned => self.banned = value,
            NodeFlag::Decommissioned => self.decommissioned = value,
            NodeFlag::DisableTabletCells => self.disable_tablet_cells = value,
            NodeFlag::DisableSchedulerJobs => self.disable_scheduler_jobs = value,
        }
    }
}

/// Summary state shown in orchid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Online,
    Offline,
    Banned,
    Decommissioned,
}

/// A tablet slot occupied by one peer of a cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletSlot {
    pub cell_id: CellId,
    pub peer_id: usize,
    pub state: PeerState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub address: String,
    pub tags: BTreeSet<String>,
    pub flags: NodeFlags,
    pub online: bool,
    pub limits: ResourceVector,
    pub usage: ResourceVector,
    pub overrides: Option<ResourceVector>,
    pub tablet_slot_count: usize,
    pub tablet_slots: Vec<TabletSlot>,
    pub registered_at: Millis,
    pub last_heartbeat: Millis,
    pub offline_since: Option<Millis>,
    pub overcommit_since: Option<Millis>,
}

impl Node {
    pub fn new(address: &str, tags: BTreeSet<String>, limits: ResourceVector, slots: usize, now: Millis) -> Self {
        Self {
            address: address.to_string(),
            tags,
            flags: NodeFlags::default(),
            online: true,
            limits,
            usage: ResourceVector::zero(),
            overrides: None,
            tablet_slot_count: slots,
            tablet_slots: Vec::new(),
            registered_at: now,
            last_heartbeat: now,
            offline_since: None,
            overcommit_since: None,
        }
    }

    pub fn state(&self) -> NodeState {
        if self.flags.banned {
            NodeState::Banned
        } else if self.flags.decommissioned {
            NodeState::Decommissioned
        } else if self.online {
            NodeState::Online
        } else {
            NodeState::Offline
        }
    }

    /// Online and not banned.
    pub fn is_available(&self) -> bool {
        self.online && !self.flags.banned
    }

    /// Limits after overrides and the `disable_scheduler_jobs` flag.
    pub fn effective_limits(&self) -> ResourceVector {
        let mut limits = match &self.overrides {
            Some(overrides) => self.limits.min(overrides),
            None => self.limits.clone(),
        };
        if self.flags.disable_scheduler_jobs {
            limits.set(USER_SLOTS, 0.0);
        }
        limits
    }

    pub fn free_resources(&self) -> ResourceVector {
        self.effective_limits().sub_saturating(&self.usage)
    }

    pub fn is_overcommitted(&self) -> bool {
        !self.usage.fits(&self.effective_limits())
    }

    /// Can host a new cell peer right now (ignoring bundle filters).
    pub fn accepts_tablet_cells(&self) -> bool {
        self.is_available()
            && !self.flags.decommissioned
            && !self.flags.disable_tablet_cells
    }

    /// Can run scheduler jobs right now.
    pub fn accepts_scheduler_jobs(&self) -> bool {
        self.is_available() && !self.flags.decommissioned && !self.flags.disable_scheduler_jobs
    }

    pub fn free_tablet_slots(&self) -> usize {
        self.tablet_slot_count.saturating_sub(self.tablet_slots.len())
    }

    pub fn hosts_cell(&self, cell_id: CellId) -> bool {
        self.tablet_slots.iter().any(|s| s.cell_id == cell_id)
    }

    /// Scheduling segment taken from the `segment:<name>` tag.
    pub fn segment(&self) -> &str {
        self.tags
            .iter()
            .find_map(|t| t.strip_prefix(SEGMENT_TAG_PREFIX))
            .unwrap_or(DEFAULT_SEGMENT)
    }
}

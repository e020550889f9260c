//! Tables, tablets and the tablet state machine.
//!
//! Commands move a tablet into an intermediate state (`mounting`,
//! `freezing`, ...) and record the stable target; the next store tick
//! completes the transition once the hosting cell has a leader.

use std::fmt;

use serde::{Deserialize, Serialize};
use tessera_core::{BundleId, CellId, Millis, TabletId};
use tessera_state::TabletRows;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabletState {
    Unmounted,
    Mounting,
    Mounted,
    Freezing,
    Frozen,
    Unfreezing,
    Unmounting,
}

impl TabletState {
    pub fn is_stable(self) -> bool {
        matches!(self, TabletState::Unmounted | TabletState::Mounted | TabletState::Frozen)
    }
}

impl fmt::Display for TabletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TabletState::Unmounted => "unmounted",
            TabletState::Mounting => "mounting",
            TabletState::Mounted => "mounted",
            TabletState::Freezing => "freezing",
            TabletState::Frozen => "frozen",
            TabletState::Unfreezing => "unfreezing",
            TabletState::Unmounting => "unmounting",
        };
        f.write_str(s)
    }
}

/// Aggregate state of a table: the common tablet state, or `Transient`
/// while tablets disagree or are mid-transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableTabletState {
    Unmounted,
    Mounted,
    Frozen,
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabletCommand {
    Mount,
    FrozenMount,
    Unmount,
    Freeze,
    Unfreeze,
}

impl fmt::Display for TabletCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TabletCommand::Mount => "mount",
            TabletCommand::FrozenMount => "frozen_mount",
            TabletCommand::Unmount => "unmount",
            TabletCommand::Freeze => "freeze",
            TabletCommand::Unfreeze => "unfreeze",
        };
        f.write_str(s)
    }
}

/// Stable target state for `command` applied to a tablet whose stable
/// state is `from`; `None` means the command is an error there.
///
/// | from ↓ cmd → | mount | frozen_mount | unmount | freeze | unfreeze |
/// |---|---|---|---|---|---|
/// | mounted   | M | E | U | F | M |
/// | frozen    | E | F | U | F | M |
/// | unmounted | M | F | U | E | E |
pub fn transition(from: TabletState, command: TabletCommand) -> Option<TabletState> {
    use TabletCommand::*;
    use TabletState::*;
    match (from, command) {
        (Mounted, Mount) => Some(Mounted),
        (Mounted, FrozenMount) => None,
        (Mounted, Unmount) => Some(Unmounted),
        (Mounted, Freeze) => Some(Frozen),
        (Mounted, Unfreeze) => Some(Mounted),
        (Frozen, Mount) => None,
        (Frozen, FrozenMount) => Some(Frozen),
        (Frozen, Unmount) => Some(Unmounted),
        (Frozen, Freeze) => Some(Frozen),
        (Frozen, Unfreeze) => Some(Mounted),
        (Unmounted, Mount) => Some(Mounted),
        (Unmounted, FrozenMount) => Some(Frozen),
        (Unmounted, Unmount) => Some(Unmounted),
        (Unmounted, Freeze) => None,
        (Unmounted, Unfreeze) => None,
        _ => None,
    }
}

/// Intermediate state shown while moving from `from` to `to`.
pub fn intermediate(from: TabletState, to: TabletState) -> TabletState {
    use TabletState::*;
    match (from, to) {
        (Unmounted, Mounted) | (Unmounted, Frozen) => Mounting,
        (_, Unmounted) => Unmounting,
        (Mounted, Frozen) => Freezing,
        (Frozen, Mounted) => Unfreezing,
        (_, to) => to,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tablet {
    pub id: TabletId,
    pub index: usize,
    /// Lowest key served by this tablet.
    pub pivot_key: String,
    pub state: TabletState,
    /// Stable state the tablet is heading to.
    pub target: TabletState,
    pub cell_id: Option<CellId>,
    /// Static memory charged while mounted (in-memory tables only).
    #[serde(default)]
    pub static_memory: u64,
}

impl Tablet {
    pub fn new(index: usize, pivot_key: String) -> Self {
        Self {
            id: TabletId::new(),
            index,
            pivot_key,
            state: TabletState::Unmounted,
            target: TabletState::Unmounted,
            cell_id: None,
            static_memory: 0,
        }
    }

    pub fn in_transition(&self) -> bool {
        self.state != self.target
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub path: String,
    pub bundle_id: BundleId,
    pub account: String,
    /// In-memory tables charge their stored bytes as tablet static memory.
    pub in_memory: bool,
    pub tablets: Vec<Tablet>,
    /// Rows of unmounted tablets (the flushed chunk store).
    pub stored_rows: TabletRows,
    pub created_at: Millis,
}

impl Table {
    /// Index of the tablet whose key range contains `key`.
    pub fn tablet_for_key(&self, key: &str) -> usize {
        self.tablets
            .iter()
            .rposition(|t| t.pivot_key.as_str() <= key)
            .unwrap_or(0)
    }

    /// Key range `[lower, upper)` of tablet `index`; `None` upper is unbounded.
    pub fn tablet_range(&self, index: usize) -> (String, Option<String>) {
        let lower = self.tablets[index].pivot_key.clone();
        let upper = self.tablets.get(index + 1).map(|t| t.pivot_key.clone());
        (lower, upper)
    }

    pub fn aggregate_state(&self) -> TableTabletState {
        let first = match self.tablets.first() {
            Some(t) => t.state,
            None => return TableTabletState::Unmounted,
        };
        if self.tablets.iter().any(|t| t.state != first || t.in_transition()) {
            return TableTabletState::Transient;
        }
        match first {
            TabletState::Unmounted => TableTabletState::Unmounted,
            TabletState::Mounted => TableTabletState::Mounted,
            TabletState::Frozen => TableTabletState::Frozen,
            _ => TableTabletState::Transient,
        }
    }

    pub fn static_memory(&self) -> u64 {
        self.tablets.iter().map(|t| t.static_memory).sum()
    }

    /// Serialized size of the stored rows.
    pub fn stored_bytes(&self) -> u64 {
        self.stored_rows
            .iter()
            .map(|(k, v)| (k.len() + v.to_string().len()) as u64)
            .sum()
    }
}

/// Rows of `rows` in `[lower, upper)`.
pub fn rows_in_range(rows: &TabletRows, lower: &str, upper: Option<&str>) -> TabletRows {
    rows.iter()
        .filter(|(k, _)| k.as_str() >= lower && upper.is_none_or(|u| k.as_str() < u))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use TabletCommand::*;
    use TabletState::*;

    #[test]
    fn transition_table_matches_contract() {
        let cases = [
            (Mounted, [Some(Mounted), None, Some(Unmounted), Some(Frozen), Some(Mounted)]),
            (Frozen, [None, Some(Frozen), Some(Unmounted), Some(Frozen), Some(Mounted)]),
            (Unmounted, [Some(Mounted), Some(Frozen), Some(Unmounted), None, None]),
        ];
        let commands = [Mount, FrozenMount, Unmount, Freeze, Unfreeze];
        for (from, expected) in cases {
            for (cmd, want) in commands.iter().zip(expected) {
                assert_eq!(transition(from, *cmd), want, "{from} / {cmd}");
            }
        }
    }

    #[test]
    fn intermediate_states() {
        assert_eq!(intermediate(Unmounted, Frozen), Mounting);
        assert_eq!(intermediate(Mounted, Unmounted), Unmounting);
        assert_eq!(intermediate(Frozen, Mounted), Unfreezing);
        assert_eq!(intermediate(Mounted, Frozen), Freezing);
    }

    #[test]
    fn key_routing_uses_pivots() {
        let table = Table {
            path: "//t".into(),
            bundle_id: BundleId(0),
            account: "tmp".into(),
            in_memory: false,
            tablets: vec![Tablet::new(0, String::new()), Tablet::new(1, "m".into())],
            stored_rows: TabletRows::new(),
            created_at: 0,
        };
        assert_eq!(table.tablet_for_key("a"), 0);
        assert_eq!(table.tablet_for_key("m"), 1);
        assert_eq!(table.tablet_for_key("z"), 1);
        assert_eq!(table.tablet_range(0), (String::new(), Some("m".to_string())));
        assert_eq!(table.aggregate_state(), TableTabletState::Unmounted);
    }
}

//! Tablet actions: administrator-submitted moves and reshards.
//!
//! An action walks `pending → freezing → mounting → completed`. The
//! freezing stage freezes (unless `skip_freezing`) and unmounts the
//! tablets; the mounting stage reshards if asked to and mounts the result
//! on the target cells, restoring the frozen flag the tablets had.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use tessera_core::{CellId, Millis, TabletActionId};

use crate::error::{CellError, CellResult};
use crate::store::CellStore;
use crate::tablet::{TabletCommand, TabletState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TabletActionKind {
    /// Move tablets to `cells`, round-robin. Empty means any cell of the bundle.
    Move { cells: Vec<CellId> },
    /// Replace the (contiguous) tablets with tablets at `pivot_keys`.
    Reshard { pivot_keys: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabletActionState {
    Pending,
    Freezing,
    Mounting,
    Completed,
    Failed,
    Orphaned,
}

impl TabletActionState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TabletActionState::Completed | TabletActionState::Failed | TabletActionState::Orphaned
        )
    }
}

/// Parameters of a new tablet action.
#[derive(Debug, Clone)]
pub struct NewTabletAction {
    pub kind: TabletActionKind,
    pub table: String,
    pub tablets: Vec<usize>,
    pub keep_finished: bool,
    pub expiration_time: Option<Millis>,
    pub skip_freezing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletAction {
    pub id: TabletActionId,
    pub kind: TabletActionKind,
    pub table: String,
    pub tablets: Vec<usize>,
    pub keep_finished: bool,
    pub expiration_time: Option<Millis>,
    pub skip_freezing: bool,
    pub state: TabletActionState,
    /// Whether the tablets were frozen when the action started.
    pub was_frozen: bool,
    pub error: Option<String>,
    pub created_at: Millis,
    pub finished_at: Option<Millis>,
}

impl TabletAction {
    fn fail(&mut self, error: &CellError, now: Millis) {
        warn!(action_id = %self.id, table = %self.table, %error, "tablet action failed");
        self.state = TabletActionState::Failed;
        self.error = Some(error.to_string());
        self.finished_at = Some(now);
    }
}

impl CellStore {
    pub fn create_tablet_action(&mut self, request: NewTabletAction, now: Millis) -> CellResult<TabletActionId> {
        let table = self
            .table(&request.table)
            .ok_or_else(|| CellError::NoSuchTable(request.table.clone()))?;
        if request.tablets.is_empty() {
            return Err(CellError::Configuration("tablet action needs at least one tablet".into()));
        }
        if let Some(&bad) = request.tablets.iter().find(|&&i| i >= table.tablets.len()) {
            return Err(CellError::Configuration(format!(
                "table {} has no tablet {bad}",
                request.table
            )));
        }
        match &request.kind {
            TabletActionKind::Move { cells } => {
                for cell_id in cells {
                    let cell = self.cell(*cell_id).ok_or(CellError::NoSuchCell(*cell_id))?;
                    if cell.bundle_id != table.bundle_id {
                        return Err(CellError::Configuration(format!(
                            "cell {cell_id} does not belong to the bundle of {}",
                            request.table
                        )));
                    }
                }
            }
            TabletActionKind::Reshard { pivot_keys } => {
                let mut sorted = request.tablets.clone();
                sorted.sort_unstable();
                if sorted.windows(2).any(|w| w[1] != w[0] + 1) {
                    return Err(CellError::Configuration("reshard needs contiguous tablets".into()));
                }
                if pivot_keys.is_empty() {
                    return Err(CellError::Configuration("reshard needs pivot keys".into()));
                }
            }
        }
        let busy = self.actions.values().any(|a| {
            !a.state.is_finished()
                && a.table == request.table
                && a.tablets.iter().any(|t| request.tablets.contains(t))
        });
        if busy {
            return Err(CellError::InvalidState(
                "tablets already participate in another action".into(),
            ));
        }

        let mut tablets = request.tablets;
        tablets.sort_unstable();
        tablets.dedup();
        let action = TabletAction {
            id: TabletActionId::new(),
            kind: request.kind,
            table: request.table,
            tablets,
            keep_finished: request.keep_finished,
            expiration_time: request.expiration_time,
            skip_freezing: request.skip_freezing,
            state: TabletActionState::Pending,
            was_frozen: false,
            error: None,
            created_at: now,
            finished_at: None,
        };
        let id = action.id;
        info!(action_id = %id, table = %action.table, tablets = action.tablets.len(), "tablet action created");
        self.actions.insert(id, action);
        Ok(id)
    }

    pub fn tablet_action(&self, id: TabletActionId) -> Option<&TabletAction> {
        self.actions.get(&id)
    }

    pub fn tablet_actions(&self) -> impl Iterator<Item = &TabletAction> {
        self.actions.values()
    }

    /// Drive every action one step, then drop finished and expired ones.
    pub fn advance_tablet_actions(&mut self, now: Millis) -> CellResult<()> {
        let ids: Vec<TabletActionId> = self.actions.keys().copied().collect();
        for id in ids {
            let Some(mut action) = self.actions.remove(&id) else {
                continue;
            };
            if !action.state.is_finished() {
                if let Err(error) = self.step_action(&mut action, now) {
                    action.fail(&error, now);
                }
            }
            let expired = action.expiration_time.is_some_and(|t| t <= now);
            let drop_finished = action.state.is_finished() && !action.keep_finished;
            if expired || drop_finished {
                info!(action_id = %id, state = ?action.state, expired, "tablet action removed");
                continue;
            }
            self.actions.insert(id, action);
        }
        Ok(())
    }

    fn action_tablet_states(&self, action: &TabletAction) -> CellResult<Vec<(TabletState, TabletState)>> {
        let table = self
            .table(&action.table)
            .ok_or_else(|| CellError::NoSuchTable(action.table.clone()))?;
        action
            .tablets
            .iter()
            .map(|&i| {
                table
                    .tablets
                    .get(i)
                    .map(|t| (t.state, t.target))
                    .ok_or_else(|| CellError::InvalidState(format!("tablet {i} disappeared")))
            })
            .collect()
    }

    fn step_action(&mut self, action: &mut TabletAction, now: Millis) -> CellResult<()> {
        let states = self.action_tablet_states(action)?;
        let settled = states.iter().all(|(state, target)| state == target);
        match action.state {
            TabletActionState::Pending => {
                if !settled {
                    return Ok(());
                }
                if states.iter().any(|(s, _)| *s == TabletState::Unmounted) {
                    return Err(CellError::InvalidState(
                        "tablet action requires mounted tablets".into(),
                    ));
                }
                action.was_frozen = states.iter().all(|(s, _)| *s == TabletState::Frozen);
                if !action.skip_freezing {
                    self.tablet_command(&action.table, TabletCommand::Freeze, Some(action.tablets.as_slice()), None, now)?;
                }
                action.state = TabletActionState::Freezing;
            }
            TabletActionState::Freezing => {
                if !settled {
                    return Ok(());
                }
                if states.iter().any(|(s, _)| *s != TabletState::Unmounted) {
                    self.tablet_command(&action.table, TabletCommand::Unmount, Some(action.tablets.as_slice()), None, now)?;
                    return Ok(());
                }
                if let TabletActionKind::Reshard { pivot_keys } = &action.kind {
                    let first = action.tablets[0];
                    let last = action.tablets[action.tablets.len() - 1];
                    self.reshard_tablets(&action.table, first, last, pivot_keys.clone())?;
                    action.tablets = (first..first + pivot_keys.len()).collect();
                }
                let command = if action.was_frozen {
                    TabletCommand::FrozenMount
                } else {
                    TabletCommand::Mount
                };
                match &action.kind {
                    TabletActionKind::Move { cells } if !cells.is_empty() => {
                        for (k, &tablet) in action.tablets.iter().enumerate() {
                            let cell = cells[k % cells.len()];
                            self.tablet_command(&action.table, command, Some(std::slice::from_ref(&tablet)), Some(cell), now)?;
                        }
                    }
                    _ => {
                        self.tablet_command(&action.table, command, Some(action.tablets.as_slice()), None, now)?;
                    }
                }
                action.state = TabletActionState::Mounting;
            }
            TabletActionState::Mounting => {
                if settled {
                    action.state = TabletActionState::Completed;
                    action.finished_at = Some(now);
                    info!(action_id = %action.id, table = %action.table, "tablet action completed");
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Mark unfinished actions that target or were hosted by a removed
    /// cell as orphaned.
    pub(crate) fn orphan_actions_of(&mut self, cell_id: CellId, hosted: &[(String, usize)], now: Millis) {
        for action in self.actions.values_mut() {
            if action.state.is_finished() {
                continue;
            }
            let targets_cell = matches!(&action.kind, TabletActionKind::Move { cells } if cells.contains(&cell_id));
            let lost_tablets = hosted
                .iter()
                .any(|(table, index)| *table == action.table && action.tablets.contains(index));
            if targets_cell || lost_tablets {
                warn!(action_id = %action.id, %cell_id, "tablet action orphaned");
                action.state = TabletActionState::Orphaned;
                action.finished_at = Some(now);
            }
        }
    }

    pub fn tablet_action_orchid(&self, id: TabletActionId) -> Option<Value> {
        let action = self.actions.get(&id)?;
        Some(json!({
            "id": action.id,
            "kind": action.kind,
            "table": action.table,
            "tablets": action.tablets,
            "state": action.state,
            "keep_finished": action.keep_finished,
            "expiration_time": action.expiration_time,
            "skip_freezing": action.skip_freezing,
            "error": action.error,
        }))
    }
}

//! Tables, tablet commands and the row data plane.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use tessera_core::{CellId, Millis, Permission, TabletId};
use tessera_state::{Mutation, TabletRows};

use crate::accounts::{check_limits, AccountResources};
use crate::cell::LifeStage;
use crate::error::{CellError, CellResult};
use crate::store::CellStore;
use crate::tablet::{
    intermediate, rows_in_range, transition, Table, TableTabletState, Tablet, TabletCommand,
    TabletState,
};

fn row_bytes(key: &str, value: &Value) -> u64 {
    (key.len() + value.to_string().len()) as u64
}

fn rows_bytes(rows: &TabletRows) -> u64 {
    rows.iter().map(|(k, v)| row_bytes(k, v)).sum()
}

/// Pivot keys must start with the empty key and strictly increase.
fn normalize_pivots(pivot_keys: Vec<String>) -> CellResult<Vec<String>> {
    if pivot_keys.is_empty() {
        return Ok(vec![String::new()]);
    }
    if !pivot_keys[0].is_empty() {
        return Err(CellError::Configuration(
            "first pivot key must be the empty key".into(),
        ));
    }
    if pivot_keys.windows(2).any(|w| w[0] >= w[1]) {
        return Err(CellError::Configuration(
            "pivot keys must be strictly increasing".into(),
        ));
    }
    Ok(pivot_keys)
}

impl CellStore {
    // ── Tables ─────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_table(
        &mut self,
        user: &str,
        path: &str,
        bundle: &str,
        account: &str,
        pivot_keys: Vec<String>,
        in_memory: bool,
        now: Millis,
    ) -> CellResult<()> {
        if self.tables.contains_key(path) {
            return Err(CellError::TableExists(path.to_string()));
        }
        let b = self.bundle_by_name(bundle)?;
        if b.is_removing() {
            return Err(CellError::BundleBeingRemoved(bundle.to_string()));
        }
        self.require(&b.acl, user, Permission::Use, &format!("bundle {bundle:?}"))?;
        let bundle_id = b.id;
        let pivots = normalize_pivots(pivot_keys)?;
        let delta = AccountResources::tablets(pivots.len() as u64);
        check_limits(&format!("bundle {bundle:?}"), &b.resource_usage, &b.resource_limits, &delta)?;
        self.accounts.charge(account, &delta)?;

        if let Some(b) = self.bundle_mut(bundle_id) {
            b.ref_count += 1;
            b.resource_usage = b.resource_usage.add(&delta);
        }
        let tablets = pivots
            .into_iter()
            .enumerate()
            .map(|(i, pivot)| Tablet::new(i, pivot))
            .collect::<Vec<_>>();
        info!(table = path, bundle, account, tablets = tablets.len(), "table created");
        self.tables.insert(
            path.to_string(),
            Table {
                path: path.to_string(),
                bundle_id,
                account: account.to_string(),
                in_memory,
                tablets,
                stored_rows: TabletRows::new(),
                created_at: now,
            },
        );
        Ok(())
    }

    pub fn table(&self, path: &str) -> Option<&Table> {
        self.tables.get(path)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    pub fn table_state(&self, path: &str) -> CellResult<TableTabletState> {
        self.tables
            .get(path)
            .map(Table::aggregate_state)
            .ok_or_else(|| CellError::NoSuchTable(path.to_string()))
    }

    fn table_entry(&self, path: &str) -> CellResult<&Table> {
        self.tables
            .get(path)
            .ok_or_else(|| CellError::NoSuchTable(path.to_string()))
    }

    fn require_unmounted(table: &Table, what: &str) -> CellResult<()> {
        if table.aggregate_state() != TableTabletState::Unmounted {
            return Err(CellError::InvalidState(format!(
                "cannot {what} table {} while it is mounted",
                table.path
            )));
        }
        Ok(())
    }

    fn table_charge(table: &Table) -> AccountResources {
        AccountResources {
            tablet_count: table.tablets.len() as u64,
            disk_space: table.stored_bytes(),
            ..AccountResources::default()
        }
    }

    /// Remove an unmounted table, releasing its account and bundle usage.
    pub fn remove_table(&mut self, path: &str) -> CellResult<()> {
        let table = self.table_entry(path)?;
        Self::require_unmounted(table, "remove")?;
        let Some(table) = self.tables.remove(path) else {
            return Ok(());
        };
        let charge = Self::table_charge(&table);
        self.accounts.release(&table.account, &charge);
        if let Some(b) = self.bundle_mut(table.bundle_id) {
            b.ref_count = b.ref_count.saturating_sub(1);
            b.resource_usage = b
                .resource_usage
                .sub(&AccountResources::tablets(table.tablets.len() as u64));
        }
        info!(table = path, "table removed");
        Ok(())
    }

    /// Move the table's usage to another account atomically.
    pub fn set_table_account(&mut self, path: &str, account: &str) -> CellResult<()> {
        let table = self.table_entry(path)?;
        let mut charge = Self::table_charge(table);
        charge.tablet_static_memory = table.static_memory();
        let from = table.account.clone();
        self.accounts.transfer(&from, account, &charge)?;
        if let Some(table) = self.tables.get_mut(path) {
            table.account = account.to_string();
        }
        info!(table = path, from = %from, to = account, "table account changed");
        Ok(())
    }

    /// Rebind an unmounted table to another bundle.
    pub fn set_table_bundle(&mut self, user: &str, path: &str, bundle: &str) -> CellResult<()> {
        let table = self.table_entry(path)?;
        Self::require_unmounted(table, "change bundle of")?;
        let old_id = table.bundle_id;
        let delta = AccountResources::tablets(table.tablets.len() as u64);
        let b = self.bundle_by_name(bundle)?;
        if b.is_removing() {
            return Err(CellError::BundleBeingRemoved(bundle.to_string()));
        }
        self.require(&b.acl, user, Permission::Use, &format!("bundle {bundle:?}"))?;
        let new_id = b.id;
        if new_id == old_id {
            return Ok(());
        }
        check_limits(&format!("bundle {bundle:?}"), &b.resource_usage, &b.resource_limits, &delta)?;
        if let Some(old) = self.bundle_mut(old_id) {
            old.ref_count = old.ref_count.saturating_sub(1);
            old.resource_usage = old.resource_usage.sub(&delta);
        }
        if let Some(new) = self.bundle_mut(new_id) {
            new.ref_count += 1;
            new.resource_usage = new.resource_usage.add(&delta);
        }
        if let Some(table) = self.tables.get_mut(path) {
            table.bundle_id = new_id;
        }
        info!(table = path, bundle, "table bundle changed");
        Ok(())
    }

    /// Replace every tablet of an unmounted table.
    pub fn reshard_table(&mut self, path: &str, pivot_keys: Vec<String>) -> CellResult<()> {
        let last = self.table_entry(path)?.tablets.len() - 1;
        self.reshard_tablets(path, 0, last, pivot_keys)
    }

    /// Replace unmounted tablets `first..=last` by tablets at `pivot_keys`.
    /// The first pivot must equal the pivot of tablet `first`.
    pub fn reshard_tablets(
        &mut self,
        path: &str,
        first: usize,
        last: usize,
        pivot_keys: Vec<String>,
    ) -> CellResult<()> {
        let table = self.table_entry(path)?;
        if first > last || last >= table.tablets.len() {
            return Err(CellError::Configuration(format!(
                "invalid tablet range {first}..={last}"
            )));
        }
        if table.tablets[first..=last]
            .iter()
            .any(|t| t.state != TabletState::Unmounted || t.in_transition())
        {
            return Err(CellError::InvalidState(format!(
                "tablets {first}..={last} of {path} must be unmounted to reshard"
            )));
        }
        if pivot_keys.is_empty() || pivot_keys[0] != table.tablets[first].pivot_key {
            return Err(CellError::Configuration(
                "first pivot key must match the first resharded tablet".into(),
            ));
        }
        if pivot_keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(CellError::Configuration(
                "pivot keys must be strictly increasing".into(),
            ));
        }
        if let Some(next) = table.tablets.get(last + 1) {
            if pivot_keys.last().is_some_and(|k| *k >= next.pivot_key) {
                return Err(CellError::Configuration(
                    "pivot keys must stay below the next tablet".into(),
                ));
            }
        }

        let old_count = (last - first + 1) as u64;
        let new_count = pivot_keys.len() as u64;
        let account = table.account.clone();
        let bundle_id = table.bundle_id;
        if new_count > old_count {
            let grow = AccountResources::tablets(new_count - old_count);
            if let Some(b) = self.bundle(bundle_id) {
                check_limits(&format!("bundle {:?}", b.name), &b.resource_usage, &b.resource_limits, &grow)?;
            }
            self.accounts.charge(&account, &grow)?;
            if let Some(b) = self.bundle_mut(bundle_id) {
                b.resource_usage = b.resource_usage.add(&grow);
            }
        } else if new_count < old_count {
            let shrink = AccountResources::tablets(old_count - new_count);
            self.accounts.release(&account, &shrink);
            if let Some(b) = self.bundle_mut(bundle_id) {
                b.resource_usage = b.resource_usage.sub(&shrink);
            }
        }

        if let Some(table) = self.tables.get_mut(path) {
            let replacement: Vec<Tablet> = pivot_keys
                .into_iter()
                .map(|pivot| Tablet::new(0, pivot))
                .collect();
            table.tablets.splice(first..=last, replacement);
            for (i, tablet) in table.tablets.iter_mut().enumerate() {
                tablet.index = i;
            }
            info!(table = path, tablets = table.tablets.len(), "table resharded");
        }
        Ok(())
    }

    // ── Tablet commands ────────────────────────────────────────────

    pub fn mount_table(&mut self, path: &str, cell: Option<CellId>, frozen: bool, now: Millis) -> CellResult<()> {
        let command = if frozen {
            TabletCommand::FrozenMount
        } else {
            TabletCommand::Mount
        };
        self.tablet_command(path, command, None, cell, now)
    }

    pub fn unmount_table(&mut self, path: &str, now: Millis) -> CellResult<()> {
        self.tablet_command(path, TabletCommand::Unmount, None, None, now)
    }

    pub fn freeze_table(&mut self, path: &str, now: Millis) -> CellResult<()> {
        self.tablet_command(path, TabletCommand::Freeze, None, None, now)
    }

    pub fn unfreeze_table(&mut self, path: &str, now: Millis) -> CellResult<()> {
        self.tablet_command(path, TabletCommand::Unfreeze, None, None, now)
    }

    /// Push fresh settings to mounted tablets. Tablet states do not change.
    pub fn remount_table(&mut self, path: &str) -> CellResult<usize> {
        let table = self.table_entry(path)?;
        let remounted = table
            .tablets
            .iter()
            .filter(|t| matches!(t.state, TabletState::Mounted | TabletState::Frozen))
            .count();
        debug!(table = path, remounted, "table remounted");
        Ok(remounted)
    }

    /// Number of tablets hosted per cell.
    pub fn cell_tablet_counts(&self) -> BTreeMap<CellId, usize> {
        let mut counts: BTreeMap<CellId, usize> = self.cells.keys().map(|id| (*id, 0)).collect();
        for tablet in self.tables.values().flat_map(|t| t.tablets.iter()) {
            if let Some(cell) = tablet.cell_id {
                *counts.entry(cell).or_default() += 1;
            }
        }
        counts
    }

    /// Tablets hosted by a cell as `(table, index)`.
    pub fn cell_tablets(&self, cell_id: CellId) -> Vec<(String, usize)> {
        self.tables
            .values()
            .flat_map(|t| {
                t.tablets
                    .iter()
                    .filter(move |tb| tb.cell_id == Some(cell_id))
                    .map(move |tb| (t.path.clone(), tb.index))
            })
            .collect()
    }

    /// Apply `command` to tablets `indices` (all when `None`). Every tablet
    /// is validated before any of them changes. Data moves immediately;
    /// the tablets settle into their target state on the next tick.
    pub fn tablet_command(
        &mut self,
        path: &str,
        command: TabletCommand,
        indices: Option<&[usize]>,
        cell: Option<CellId>,
        now: Millis,
    ) -> CellResult<()> {
        let table = self.table_entry(path)?;
        let indices: Vec<usize> = match indices {
            Some(indices) => indices.to_vec(),
            None => (0..table.tablets.len()).collect(),
        };

        let mut plan = Vec::with_capacity(indices.len());
        for &i in &indices {
            let tablet = table.tablets.get(i).ok_or_else(|| {
                CellError::Configuration(format!("table {path} has no tablet {i}"))
            })?;
            if tablet.in_transition() {
                return Err(CellError::InvalidState(format!(
                    "tablet {i} of {path} is {}",
                    tablet.state
                )));
            }
            let target = transition(tablet.target, command).ok_or_else(|| {
                CellError::InvalidTransition {
                    command: command.to_string(),
                    state: tablet.state.to_string(),
                }
            })?;
            if target != tablet.target {
                plan.push((i, tablet.target, target));
            }
        }
        if plan.is_empty() {
            return Ok(());
        }

        let bundle_id = table.bundle_id;
        let account = table.account.clone();
        let mounting: Vec<usize> = plan
            .iter()
            .filter(|(_, from, _)| *from == TabletState::Unmounted)
            .map(|(i, _, _)| *i)
            .collect();

        // Static memory of in-memory tables moves with the data.
        let mut mount_bytes: BTreeMap<usize, u64> = BTreeMap::new();
        let mut static_release = 0u64;
        if table.in_memory {
            for (i, from, to) in &plan {
                if *from == TabletState::Unmounted {
                    let (lower, upper) = table.tablet_range(*i);
                    let rows = rows_in_range(&table.stored_rows, &lower, upper.as_deref());
                    mount_bytes.insert(*i, rows_bytes(&rows));
                } else if *to == TabletState::Unmounted {
                    static_release += table.tablets[*i].static_memory;
                }
            }
        }
        let placement = self.place_tablets(table, &mounting, cell)?;

        let static_delta: u64 = mount_bytes.values().sum();
        if static_delta > 0 {
            let delta = AccountResources {
                tablet_static_memory: static_delta,
                ..AccountResources::default()
            };
            if let Some(b) = self.bundle(bundle_id) {
                check_limits(&format!("bundle {:?}", b.name), &b.resource_usage, &b.resource_limits, &delta)?;
            }
            self.accounts.charge(&account, &delta)?;
            if let Some(b) = self.bundle_mut(bundle_id) {
                b.resource_usage = b.resource_usage.add(&delta);
            }
        }

        let mut commits: BTreeMap<CellId, Vec<(TabletId, Mutation)>> = BTreeMap::new();
        for (i, from, to) in plan {
            if to == TabletState::Unmounted {
                let (tablet_id, cell_id) = {
                    let t = &self.table_entry(path)?.tablets[i];
                    (t.id, t.cell_id)
                };
                let Some(cell_id) = cell_id else {
                    continue;
                };
                let rows = self
                    .rows
                    .tablet_rows(cell_id, tablet_id)?
                    .cloned()
                    .unwrap_or_default();
                commits
                    .entry(cell_id)
                    .or_default()
                    .push((tablet_id, Mutation::UnmountTablet));
                if let Some(table) = self.tables.get_mut(path) {
                    table.stored_rows.extend(rows);
                    let tablet = &mut table.tablets[i];
                    tablet.cell_id = None;
                    tablet.static_memory = 0;
                    tablet.state = intermediate(from, to);
                    tablet.target = to;
                }
            } else if from == TabletState::Unmounted {
                let Some(&cell_id) = placement.get(&i) else {
                    continue;
                };
                if let Some(table) = self.tables.get_mut(path) {
                    let (lower, upper) = table.tablet_range(i);
                    let rows = rows_in_range(&table.stored_rows, &lower, upper.as_deref());
                    for key in rows.keys() {
                        table.stored_rows.remove(key);
                    }
                    let tablet = &mut table.tablets[i];
                    commits
                        .entry(cell_id)
                        .or_default()
                        .push((tablet.id, Mutation::MountTablet { rows }));
                    tablet.cell_id = Some(cell_id);
                    tablet.static_memory = mount_bytes.get(&i).copied().unwrap_or(0);
                    tablet.state = intermediate(from, to);
                    tablet.target = to;
                }
            } else if let Some(table) = self.tables.get_mut(path) {
                let tablet = &mut table.tablets[i];
                tablet.state = intermediate(from, to);
                tablet.target = to;
            }
        }
        for (cell_id, mutations) in commits {
            self.commit_rows(cell_id, mutations, now)?;
        }

        if static_release > 0 {
            let delta = AccountResources {
                tablet_static_memory: static_release,
                ..AccountResources::default()
            };
            self.accounts.release(&account, &delta);
            if let Some(b) = self.bundle_mut(bundle_id) {
                b.resource_usage = b.resource_usage.sub(&delta);
            }
        }
        info!(table = path, %command, tablets = indices.len(), "tablet command applied");
        Ok(())
    }

    /// Choose a cell for each mounting tablet: the requested one, or the
    /// running cell of the bundle with the fewest tablets.
    fn place_tablets(
        &self,
        table: &Table,
        tablets: &[usize],
        requested: Option<CellId>,
    ) -> CellResult<BTreeMap<usize, CellId>> {
        let mut placement = BTreeMap::new();
        if tablets.is_empty() {
            return Ok(placement);
        }
        if let Some(cell_id) = requested {
            let cell = self.cells.get(&cell_id).ok_or(CellError::NoSuchCell(cell_id))?;
            if cell.bundle_id != table.bundle_id {
                return Err(CellError::Configuration(format!(
                    "cell {cell_id} does not belong to the bundle of {}",
                    table.path
                )));
            }
            if cell.life_stage != LifeStage::Running {
                return Err(CellError::InvalidState(format!("cell {cell_id} is decommissioned")));
            }
            placement.extend(tablets.iter().map(|&i| (i, cell_id)));
            return Ok(placement);
        }

        let mut counts: Vec<(usize, CellId)> = {
            let all = self.cell_tablet_counts();
            self.cells
                .values()
                .filter(|c| c.bundle_id == table.bundle_id && c.life_stage == LifeStage::Running)
                .map(|c| (all.get(&c.id).copied().unwrap_or(0), c.id))
                .collect()
        };
        if counts.is_empty() {
            let name = self
                .bundle(table.bundle_id)
                .map(|b| b.name.clone())
                .unwrap_or_default();
            return Err(CellError::NoHealthyCells(name));
        }
        for &i in tablets {
            counts.sort();
            let (count, cell_id) = &mut counts[0];
            *count += 1;
            placement.insert(i, *cell_id);
        }
        Ok(placement)
    }

    /// Persist mutations to a cell's changelog and track its ids.
    pub(crate) fn commit_rows(
        &mut self,
        cell_id: CellId,
        mutations: Vec<(TabletId, Mutation)>,
        now: Millis,
    ) -> CellResult<()> {
        let seq = self.rows.commit(cell_id, mutations, now)?;
        let mut snapshot_id = None;
        if let Some(cell) = self.cells.get_mut(&cell_id) {
            cell.max_changelog_id = seq;
            if self.rows.wants_snapshot(cell_id) {
                cell.max_snapshot_id += 1;
                snapshot_id = Some(cell.max_snapshot_id);
            }
        }
        if let Some(id) = snapshot_id {
            self.rows.build_snapshot(cell_id, id)?;
        }
        Ok(())
    }

    /// Finish in-flight tablet transitions whose cell is ready.
    pub fn complete_tablet_transitions(&mut self, _now: Millis) -> CellResult<usize> {
        let leaders: BTreeMap<CellId, bool> = self
            .cells
            .values()
            .map(|c| (c.id, c.leading_peer().is_some()))
            .collect();
        let mut completed = 0;
        for table in self.tables.values_mut() {
            for tablet in table.tablets.iter_mut().filter(|t| t.in_transition()) {
                let ready = match (tablet.target, tablet.cell_id) {
                    (TabletState::Unmounted, _) => true,
                    (_, Some(cell)) => match leaders.get(&cell) {
                        Some(has_leader) => *has_leader,
                        None => {
                            warn!(table = %table.path, tablet = tablet.index, "tablet cell vanished during transition");
                            tablet.cell_id = None;
                            tablet.target = TabletState::Unmounted;
                            true
                        }
                    },
                    (_, None) => {
                        tablet.target = TabletState::Unmounted;
                        true
                    }
                };
                if ready {
                    debug!(table = %table.path, tablet = tablet.index, state = %tablet.target, "tablet transition completed");
                    tablet.state = tablet.target;
                    completed += 1;
                }
            }
        }
        Ok(completed)
    }

    // ── Data plane ─────────────────────────────────────────────────

    /// Tablet serving `key` for writes: `(tablet id, cell id)`.
    fn write_target(&self, path: &str, key: &str) -> CellResult<(TabletId, CellId)> {
        let table = self.table_entry(path)?;
        let index = table.tablet_for_key(key);
        let tablet = &table.tablets[index];
        match tablet.state {
            TabletState::Mounted => {}
            TabletState::Frozen | TabletState::Freezing | TabletState::Unfreezing => {
                return Err(CellError::TabletFrozen {
                    table: path.to_string(),
                    index,
                });
            }
            _ => {
                return Err(CellError::TabletNotMounted {
                    table: path.to_string(),
                    index,
                });
            }
        }
        let cell_id = tablet.cell_id.ok_or_else(|| CellError::TabletNotMounted {
            table: path.to_string(),
            index,
        })?;
        let cell = self.cells.get(&cell_id).ok_or(CellError::NoSuchCell(cell_id))?;
        if cell.life_stage != LifeStage::Running {
            return Err(CellError::CellNotWritable {
                cell: cell_id,
                reason: "cell is being decommissioned".into(),
            });
        }
        if cell.leading_peer().is_none() {
            return Err(CellError::NoLeader(cell_id));
        }
        Ok((tablet.id, cell_id))
    }

    /// Tablet `index` for reads; frozen tablets stay readable.
    fn read_target(&self, path: &str, index: usize) -> CellResult<(TabletId, CellId)> {
        let table = self.table_entry(path)?;
        let tablet = &table.tablets[index];
        let not_mounted = || CellError::TabletNotMounted {
            table: path.to_string(),
            index,
        };
        if !matches!(
            tablet.state,
            TabletState::Mounted | TabletState::Frozen | TabletState::Freezing | TabletState::Unfreezing
        ) {
            return Err(not_mounted());
        }
        let cell_id = tablet.cell_id.ok_or_else(not_mounted)?;
        let cell = self.cells.get(&cell_id).ok_or(CellError::NoSuchCell(cell_id))?;
        if cell.leading_peer().is_none() {
            return Err(CellError::NoLeader(cell_id));
        }
        Ok((tablet.id, cell_id))
    }

    fn write_rows(&mut self, path: &str, writes: Vec<(String, Option<Value>)>, now: Millis) -> CellResult<()> {
        if self.safe_mode {
            return Err(CellError::SafeMode);
        }
        let mut targets = Vec::with_capacity(writes.len());
        for (key, _) in &writes {
            targets.push(self.write_target(path, key)?);
        }

        let mut grow = 0u64;
        let mut shrink = 0u64;
        for ((key, value), (tablet_id, cell_id)) in writes.iter().zip(&targets) {
            let old = self
                .rows
                .tablet_rows(*cell_id, *tablet_id)?
                .and_then(|rows| rows.get(key))
                .map(|v| row_bytes(key, v))
                .unwrap_or(0);
            let new = value.as_ref().map(|v| row_bytes(key, v)).unwrap_or(0);
            if new > old {
                grow += new - old;
            } else {
                shrink += old - new;
            }
        }
        let account = self.table_entry(path)?.account.clone();
        let net = AccountResources {
            disk_space: grow.saturating_sub(shrink),
            ..AccountResources::default()
        };
        self.accounts.charge(&account, &net)?;
        self.accounts.release(
            &account,
            &AccountResources {
                disk_space: shrink.saturating_sub(grow),
                ..AccountResources::default()
            },
        );

        let mut commits: BTreeMap<CellId, Vec<(TabletId, Mutation)>> = BTreeMap::new();
        for ((key, value), (tablet_id, cell_id)) in writes.into_iter().zip(targets) {
            let mutation = match value {
                Some(value) => Mutation::Write { key, value },
                None => Mutation::Delete { key },
            };
            commits.entry(cell_id).or_default().push((tablet_id, mutation));
        }
        for (cell_id, mutations) in commits {
            self.commit_rows(cell_id, mutations, now)?;
        }
        Ok(())
    }

    /// Upsert rows. Fails unless every target tablet is mounted and its
    /// cell is running with a leader.
    pub fn insert_rows(&mut self, path: &str, rows: Vec<(String, Value)>, now: Millis) -> CellResult<()> {
        let count = rows.len();
        self.write_rows(path, rows.into_iter().map(|(k, v)| (k, Some(v))).collect(), now)?;
        debug!(table = path, count, "rows inserted");
        Ok(())
    }

    pub fn delete_rows(&mut self, path: &str, keys: Vec<String>, now: Millis) -> CellResult<()> {
        let count = keys.len();
        self.write_rows(path, keys.into_iter().map(|k| (k, None)).collect(), now)?;
        debug!(table = path, count, "rows deleted");
        Ok(())
    }

    pub fn lookup_rows(&mut self, path: &str, keys: &[String]) -> CellResult<Vec<Option<Value>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let index = self.table_entry(path)?.tablet_for_key(key);
            let (tablet_id, cell_id) = self.read_target(path, index)?;
            let value = self
                .rows
                .tablet_rows(cell_id, tablet_id)?
                .and_then(|rows| rows.get(key))
                .cloned();
            out.push(value);
        }
        Ok(out)
    }

    /// Every row of the table in key order.
    pub fn select_all(&mut self, path: &str) -> CellResult<Vec<(String, Value)>> {
        let count = self.table_entry(path)?.tablets.len();
        let mut out = Vec::new();
        for index in 0..count {
            let (tablet_id, cell_id) = self.read_target(path, index)?;
            if let Some(rows) = self.rows.tablet_rows(cell_id, tablet_id)? {
                out.extend(rows.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        Ok(out)
    }

    pub fn table_orchid(&self, path: &str) -> Option<Value> {
        let table = self.tables.get(path)?;
        Some(json!({
            "path": table.path,
            "bundle": self.bundle(table.bundle_id).map(|b| b.name.as_str()),
            "account": table.account,
            "in_memory": table.in_memory,
            "tablet_state": table.aggregate_state(),
            "tablets": table.tablets.iter().map(|t| json!({
                "tablet_id": t.id,
                "index": t.index,
                "pivot_key": t.pivot_key,
                "state": t.state,
                "cell_id": t.cell_id,
            })).collect::<Vec<_>>(),
        }))
    }
}

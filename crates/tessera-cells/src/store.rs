//! The bundle and cell store.
//!
//! Bundles live in an arena indexed by [`BundleId`]; cells are owned by the
//! store and only remember their bundle id, so the list of a bundle's cells
//! is computed on demand. The store is the authority for peer placement:
//! node slot tables are derived from it by the balancer.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use tessera_core::{
    Acl, BundleId, CellId, Millis, PeerState, Permission, TabletActionId, TagFilter,
    TransactionId, UserDirectory,
};
use tessera_state::StateStore;

use crate::accounts::{AccountLimits, AccountRegistry};
use crate::actions::TabletAction;
use crate::bundle::{Bundle, BundleBalancerConfig, BundleOptions, DynamicBundleOptions, RemovalState};
use crate::cell::{Cell, LifeStage, Peer, PeerMove};
use crate::error::{CellError, CellResult};
use crate::rows::RowStore;
use crate::tablet::{Table, TabletState};

pub struct CellStore {
    pub(crate) bundles: Vec<Option<Bundle>>,
    pub(crate) bundle_names: BTreeMap<String, BundleId>,
    pub(crate) cells: BTreeMap<CellId, Cell>,
    pub(crate) tables: BTreeMap<String, Table>,
    pub(crate) actions: BTreeMap<TabletActionId, TabletAction>,
    pub(crate) rows: RowStore,
    pub(crate) users: UserDirectory,
    pub(crate) accounts: AccountRegistry,
    bundle_schema_acl: Acl,
    pub(crate) safe_mode: bool,
}

impl CellStore {
    pub fn new(state: StateStore) -> Self {
        Self {
            bundles: Vec::new(),
            bundle_names: BTreeMap::new(),
            cells: BTreeMap::new(),
            tables: BTreeMap::new(),
            actions: BTreeMap::new(),
            rows: RowStore::new(state),
            users: UserDirectory::default(),
            accounts: AccountRegistry::default(),
            bundle_schema_acl: Acl::default(),
            safe_mode: false,
        }
    }

    /// Store over an in-memory state store, for tests and dry runs.
    pub fn in_memory() -> CellResult<Self> {
        Ok(Self::new(StateStore::open_in_memory()?))
    }

    pub fn with_snapshot_threshold(mut self, records: u64) -> Self {
        self.rows = self.rows.with_snapshot_threshold(records);
        self
    }

    /// ACL consulted for the `create` permission on new bundles.
    pub fn with_bundle_schema_acl(mut self, acl: Acl) -> Self {
        self.bundle_schema_acl = acl;
        self
    }

    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    pub fn users_mut(&mut self) -> &mut UserDirectory {
        &mut self.users
    }

    pub fn accounts(&self) -> &AccountRegistry {
        &self.accounts
    }

    pub fn accounts_mut(&mut self) -> &mut AccountRegistry {
        &mut self.accounts
    }

    pub fn set_safe_mode(&mut self, enabled: bool) {
        if self.safe_mode != enabled {
            info!(enabled, "safe mode changed");
        }
        self.safe_mode = enabled;
    }

    pub fn safe_mode(&self) -> bool {
        self.safe_mode
    }

    pub(crate) fn require(&self, acl: &Acl, user: &str, permission: Permission, object: &str) -> CellResult<()> {
        if self.users.check(acl, user, permission) {
            Ok(())
        } else {
            Err(CellError::AccessDenied {
                user: user.to_string(),
                permission,
                object: object.to_string(),
            })
        }
    }

    fn validate_acl(&self, acl: &Acl) -> CellResult<()> {
        acl.validate(|s| self.users.is_known_subject(s))?;
        Ok(())
    }

    fn validate_options(&self, options: &BundleOptions) -> CellResult<()> {
        if options.peer_count == 0 {
            return Err(CellError::Configuration("peer_count must be at least 1".into()));
        }
        for account in [&options.changelog_account, &options.snapshot_account] {
            if !self.accounts.exists(account) {
                return Err(CellError::Configuration(format!("unknown account {account:?}")));
            }
        }
        Ok(())
    }

    // ── Bundles ────────────────────────────────────────────────────

    pub fn create_bundle(
        &mut self,
        user: &str,
        name: &str,
        options: BundleOptions,
        acl: Acl,
        now: Millis,
    ) -> CellResult<BundleId> {
        self.require(&self.bundle_schema_acl, user, Permission::Create, "tablet cell bundle schema")?;
        if name.is_empty() {
            return Err(CellError::Configuration("bundle name must not be empty".into()));
        }
        if self.bundle_names.contains_key(name) {
            return Err(CellError::BundleExists(name.to_string()));
        }
        self.validate_options(&options)?;
        self.validate_acl(&acl)?;

        let id = BundleId(self.bundles.len() as u32);
        self.bundles.push(Some(Bundle {
            id,
            name: name.to_string(),
            options,
            dynamic_options: DynamicBundleOptions::default(),
            node_tag_filter: TagFilter::any(),
            balancer_config: BundleBalancerConfig::default(),
            acl,
            resource_limits: AccountLimits::default(),
            resource_usage: Default::default(),
            removal: RemovalState::None,
            ref_count: 0,
            created_at: now,
        }));
        self.bundle_names.insert(name.to_string(), id);
        info!(bundle = name, %id, user, "tablet cell bundle created");
        Ok(id)
    }

    pub fn bundle(&self, id: BundleId) -> Option<&Bundle> {
        self.bundles.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub(crate) fn bundle_mut(&mut self, id: BundleId) -> Option<&mut Bundle> {
        self.bundles.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn bundle_id(&self, name: &str) -> CellResult<BundleId> {
        self.bundle_names
            .get(name)
            .copied()
            .ok_or_else(|| CellError::NoSuchBundle(name.to_string()))
    }

    pub fn bundle_by_name(&self, name: &str) -> CellResult<&Bundle> {
        let id = self.bundle_id(name)?;
        self.bundle(id).ok_or_else(|| CellError::NoSuchBundle(name.to_string()))
    }

    pub fn bundles(&self) -> impl Iterator<Item = &Bundle> {
        self.bundles.iter().flatten()
    }

    /// Cells of a bundle, in id order.
    pub fn bundle_cells(&self, id: BundleId) -> Vec<CellId> {
        self.cells
            .values()
            .filter(|c| c.bundle_id == id)
            .map(|c| c.id)
            .collect()
    }

    /// Look up a bundle the user may administer.
    fn administered_bundle(&mut self, user: &str, name: &str) -> CellResult<&mut Bundle> {
        let id = self.bundle_id(name)?;
        let acl = self
            .bundle(id)
            .map(|b| b.acl.clone())
            .ok_or_else(|| CellError::NoSuchBundle(name.to_string()))?;
        self.require(&acl, user, Permission::Administer, &format!("bundle {name:?}"))?;
        self.bundle_mut(id)
            .ok_or_else(|| CellError::NoSuchBundle(name.to_string()))
    }

    pub fn rename_bundle(&mut self, user: &str, name: &str, new_name: &str) -> CellResult<()> {
        if new_name.is_empty() {
            return Err(CellError::Configuration("bundle name must not be empty".into()));
        }
        if name == new_name {
            return Ok(());
        }
        if self.bundle_names.contains_key(new_name) {
            return Err(CellError::BundleExists(new_name.to_string()));
        }
        let bundle = self.administered_bundle(user, name)?;
        bundle.name = new_name.to_string();
        let id = bundle.id;
        self.bundle_names.remove(name);
        self.bundle_names.insert(new_name.to_string(), id);
        info!(from = name, to = new_name, "tablet cell bundle renamed");
        Ok(())
    }

    /// Start staged removal. New tables can no longer bind to the bundle;
    /// [`CellStore::process_bundle_removals`] finishes the job once no
    /// table references it.
    pub fn remove_bundle(&mut self, user: &str, name: &str) -> CellResult<()> {
        let bundle = self.administered_bundle(user, name)?;
        if bundle.is_removing() {
            return Ok(());
        }
        bundle.removal = RemovalState::RemovalStarted;
        info!(bundle = name, ref_count = bundle.ref_count, "tablet cell bundle removal started");
        Ok(())
    }

    /// Advance staged bundle removals by one step. Returns removed names.
    pub fn process_bundle_removals(&mut self, now: Millis) -> CellResult<Vec<String>> {
        let mut removed = Vec::new();
        let ids: Vec<BundleId> = self
            .bundles()
            .filter(|b| b.is_removing())
            .map(|b| b.id)
            .collect();
        for id in ids {
            let Some((removal, ref_count)) = self.bundle(id).map(|b| (b.removal, b.ref_count)) else {
                continue;
            };
            match removal {
                RemovalState::RemovalStarted if ref_count == 0 => {
                    for cell_id in self.bundle_cells(id) {
                        self.remove_cell(cell_id, true, now)?;
                    }
                    if let Some(bundle) = self.bundle_mut(id) {
                        bundle.removal = RemovalState::RemovalPreCommitted;
                        debug!(bundle = %bundle.name, "tablet cell bundle removal pre-committed");
                    }
                }
                RemovalState::RemovalPreCommitted => {
                    if let Some(bundle) = self.bundles[id.0 as usize].take() {
                        self.bundle_names.remove(&bundle.name);
                        info!(bundle = %bundle.name, "tablet cell bundle removed");
                        removed.push(bundle.name);
                    }
                }
                _ => {}
            }
        }
        Ok(removed)
    }

    /// Replace static options. Peer count may only grow while cells exist.
    pub fn set_bundle_options(&mut self, user: &str, name: &str, options: BundleOptions) -> CellResult<()> {
        self.validate_options(&options)?;
        let id = self.bundle_id(name)?;
        let old_peer_count = self.administered_bundle(user, name)?.options.peer_count;
        let cells = self.bundle_cells(id);
        if options.peer_count < old_peer_count && !cells.is_empty() {
            return Err(CellError::InvalidState(
                "peer count can only be decreased by removing cells".into(),
            ));
        }
        if let Some(bundle) = self.bundle_mut(id) {
            bundle.options = options.clone();
        }
        if options.peer_count != old_peer_count {
            for cell_id in cells {
                if let Some(cell) = self.cells.get_mut(&cell_id) {
                    if cell.peer_count_override.is_none() {
                        resize_peers(cell, options.peer_count)?;
                    }
                }
            }
        }
        info!(bundle = name, peer_count = options.peer_count, "bundle options updated");
        Ok(())
    }

    pub fn set_bundle_dynamic_options(
        &mut self,
        user: &str,
        name: &str,
        options: DynamicBundleOptions,
    ) -> CellResult<()> {
        let bundle = self.administered_bundle(user, name)?;
        bundle.dynamic_options = options;
        debug!(bundle = name, "bundle dynamic options updated");
        Ok(())
    }

    pub fn set_bundle_node_tag_filter(&mut self, user: &str, name: &str, filter: &str) -> CellResult<()> {
        let filter = TagFilter::parse(filter)?;
        let bundle = self.administered_bundle(user, name)?;
        info!(bundle = name, filter = filter.as_str(), "bundle node tag filter updated");
        bundle.node_tag_filter = filter;
        Ok(())
    }

    pub fn set_bundle_acl(&mut self, user: &str, name: &str, acl: Acl) -> CellResult<()> {
        self.validate_acl(&acl)?;
        let bundle = self.administered_bundle(user, name)?;
        bundle.acl = acl;
        Ok(())
    }

    pub fn set_bundle_balancer_config(
        &mut self,
        user: &str,
        name: &str,
        config: BundleBalancerConfig,
    ) -> CellResult<()> {
        let bundle = self.administered_bundle(user, name)?;
        bundle.balancer_config = config;
        Ok(())
    }

    pub fn set_bundle_resource_limits(&mut self, user: &str, name: &str, limits: AccountLimits) -> CellResult<()> {
        let bundle = self.administered_bundle(user, name)?;
        bundle.resource_limits = limits;
        Ok(())
    }

    // ── Cells ──────────────────────────────────────────────────────

    /// Create a cell in `bundle`. Requires `use` on the bundle.
    pub fn create_cell(&mut self, user: &str, bundle: &str, now: Millis) -> CellResult<CellId> {
        let b = self.bundle_by_name(bundle)?;
        if b.is_removing() {
            return Err(CellError::BundleBeingRemoved(bundle.to_string()));
        }
        self.require(&b.acl, user, Permission::Use, &format!("bundle {bundle:?}"))?;
        let cell = Cell::new(b.id, b.options.peer_count, now);
        let id = cell.id;
        info!(cell_id = %id, bundle, peers = cell.peers.len(), "tablet cell created");
        self.cells.insert(id, cell);
        Ok(id)
    }

    pub fn cell(&self, id: CellId) -> Option<&Cell> {
        self.cells.get(&id)
    }

    pub fn cell_mut(&mut self, id: CellId) -> Option<&mut Cell> {
        self.cells.get_mut(&id)
    }

    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    pub fn cell_ids(&self) -> Vec<CellId> {
        self.cells.keys().copied().collect()
    }

    fn cell_entry(&mut self, id: CellId) -> CellResult<&mut Cell> {
        self.cells.get_mut(&id).ok_or(CellError::NoSuchCell(id))
    }

    /// Configured peer count, excluding temporary extra peers.
    pub fn peer_count(&self, id: CellId) -> Option<usize> {
        let cell = self.cells.get(&id)?;
        let bundle = self.bundle(cell.bundle_id)?;
        Some(cell.peer_count_override.unwrap_or(bundle.options.peer_count))
    }

    /// Override the cell's peer count, or revert to the bundle's with `None`.
    pub fn set_cell_peer_count(&mut self, id: CellId, peer_count: Option<usize>) -> CellResult<()> {
        let cell = self.cells.get(&id).ok_or(CellError::NoSuchCell(id))?;
        let bundle_peers = self
            .bundle(cell.bundle_id)
            .map(|b| b.options.peer_count)
            .unwrap_or(1);
        let target = peer_count.unwrap_or(bundle_peers);
        let cell = self.cell_entry(id)?;
        if !cell.moves.is_empty() {
            return Err(CellError::InvalidState("cell peers are being moved".into()));
        }
        resize_peers(cell, target)?;
        cell.peer_count_override = peer_count;
        Ok(())
    }

    /// Remove a cell. Without `force` the cell is decommissioned first.
    pub fn remove_cell(&mut self, id: CellId, force: bool, now: Millis) -> CellResult<()> {
        let cell = self.cell_entry(id)?;
        if force {
            return self.finalize_cell_removal(id, now);
        }
        if cell.life_stage == LifeStage::Running {
            cell.life_stage = LifeStage::DecommissioningOnNode;
            info!(cell_id = %id, "tablet cell decommissioning on node");
        }
        Ok(())
    }

    /// Decommissioning cells whose peers all stopped become decommissioned.
    pub fn mark_decommissioned(&mut self, id: CellId) -> CellResult<bool> {
        let cell = self.cell_entry(id)?;
        let stopped = cell
            .peers
            .iter()
            .all(|p| !p.is_assigned() || p.state == PeerState::Stopped);
        if cell.life_stage == LifeStage::DecommissioningOnNode && stopped {
            cell.life_stage = LifeStage::Decommissioned;
            info!(cell_id = %id, "tablet cell decommissioned");
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop the cell, its persisted data and its tablets' placement.
    pub(crate) fn finalize_cell_removal(&mut self, id: CellId, now: Millis) -> CellResult<()> {
        let Some(mut cell) = self.cells.remove(&id) else {
            return Ok(());
        };
        cell.life_stage = LifeStage::Removed;
        let hosted = self.cell_tablets(id);
        for table in self.tables.values_mut() {
            for tablet in table.tablets.iter_mut().filter(|t| t.cell_id == Some(id)) {
                warn!(table = %table.path, tablet = tablet.index, "tablet orphaned by cell removal");
                tablet.cell_id = None;
                tablet.state = TabletState::Unmounted;
                tablet.target = TabletState::Unmounted;
            }
        }
        self.rows.remove_cell(id)?;
        self.orphan_actions_of(id, &hosted, now);
        info!(cell_id = %id, "tablet cell removed");
        Ok(())
    }

    /// Abort the cell's prerequisite transaction: every peer is revoked,
    /// the config version moves forward and a fresh transaction starts.
    pub fn abort_prerequisite_transaction(&mut self, id: CellId) -> CellResult<TransactionId> {
        let cell = self.cell_entry(id)?;
        let old = cell.prerequisite_transaction_id;
        cell.prerequisite_transaction_id = TransactionId::new();
        // Extra peers only exist for the duration of a move.
        let mut extras: Vec<usize> = cell.moves.drain(..).map(|m| m.extra).collect();
        extras.sort_unstable_by(|a, b| b.cmp(a));
        extras.dedup();
        for extra in extras {
            if extra < cell.peers.len() {
                cell.peers.remove(extra);
            }
        }
        for peer in cell.peers.iter_mut() {
            *peer = Peer::default();
        }
        let version = cell.bump_version();
        let new = cell.prerequisite_transaction_id;
        self.rows.invalidate(id);
        warn!(cell_id = %id, %old, %new, version, "prerequisite transaction aborted");
        Ok(new)
    }

    /// Place peer `peer_id` on `address`.
    pub fn assign_peer(&mut self, id: CellId, peer_id: usize, address: &str, now: Millis) -> CellResult<()> {
        let cell = self.cell_entry(id)?;
        let peer = cell
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| CellError::InvalidState(format!("cell {id} has no peer {peer_id}")))?;
        peer.address = Some(address.to_string());
        peer.state = PeerState::None;
        peer.assigned_at = Some(now);
        peer.lost_since = None;
        let version = cell.bump_version();
        info!(cell_id = %id, peer_id, address, version, "cell peer assigned");
        Ok(())
    }

    /// Clear peer `peer_id`. Returns the address it occupied.
    pub fn revoke_peer(&mut self, id: CellId, peer_id: usize, reason: &str) -> CellResult<Option<String>> {
        let cell = self.cell_entry(id)?;
        let Some(peer) = cell.peers.get_mut(peer_id) else {
            return Ok(None);
        };
        let address = peer.address.take();
        let was_leader = peer.state == PeerState::Leading;
        *peer = Peer::default();
        let version = cell.bump_version();
        if was_leader {
            self.rows.invalidate(id);
        }
        info!(cell_id = %id, peer_id, address = ?address, reason, version, "cell peer revoked");
        Ok(address)
    }

    /// Node-side report of a peer's state. Stale reports are rejected.
    pub fn report_peer_state(
        &mut self,
        id: CellId,
        peer_id: usize,
        address: &str,
        state: PeerState,
        config_version: u64,
    ) -> CellResult<bool> {
        let cell = self.cell_entry(id)?;
        if config_version != cell.config_version {
            debug!(cell_id = %id, peer_id, config_version, current = cell.config_version, "stale peer report");
            return Ok(false);
        }
        let other_leader = cell
            .leading_peer()
            .is_some_and(|leader| leader != peer_id);
        let Some(peer) = cell.peers.get_mut(peer_id) else {
            return Ok(false);
        };
        if peer.address.as_deref() != Some(address) {
            return Ok(false);
        }
        if state == PeerState::Leading && other_leader {
            return Ok(false);
        }
        peer.state = state;
        peer.config_version = config_version;
        Ok(true)
    }

    /// Elect a leader among following peers at the current version,
    /// preferring peers that are not being moved away.
    pub fn elect_leader(&mut self, id: CellId) -> CellResult<Option<usize>> {
        let cell = self.cell_entry(id)?;
        if let Some(leader) = cell.leading_peer() {
            return Ok(Some(leader));
        }
        let version = cell.config_version;
        let candidates: Vec<usize> = cell
            .peers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_assigned() && p.state == PeerState::Following && p.config_version == version)
            .map(|(i, _)| i)
            .collect();
        let Some(&leader) = candidates
            .iter()
            .find(|&&i| !cell.is_moving(i))
            .or(candidates.first())
        else {
            return Ok(None);
        };
        cell.peers[leader].state = PeerState::Leading;
        self.rows.invalidate(id);
        info!(cell_id = %id, peer_id = leader, version, "cell leader elected");
        Ok(Some(leader))
    }

    /// Hand leadership to a following peer.
    pub fn transfer_leadership(&mut self, id: CellId, to: usize) -> CellResult<bool> {
        let cell = self.cell_entry(id)?;
        let version = cell.config_version;
        match cell.peers.get(to) {
            Some(p) if p.state == PeerState::Following && p.config_version == version => {}
            _ => return Ok(false),
        }
        if let Some(leader) = cell.leading_peer() {
            cell.peers[leader].state = PeerState::Following;
        }
        cell.peers[to].state = PeerState::Leading;
        self.rows.invalidate(id);
        info!(cell_id = %id, peer_id = to, "cell leadership transferred");
        Ok(true)
    }

    /// Add a temporary extra peer that will replace `source`.
    pub fn start_peer_move(&mut self, id: CellId, source: usize, now: Millis) -> CellResult<usize> {
        let cell = self.cell_entry(id)?;
        if let Some(m) = cell.moves.iter().find(|m| m.source == source) {
            return Ok(m.extra);
        }
        cell.peers.push(Peer::default());
        let extra = cell.peers.len() - 1;
        cell.moves.push(PeerMove {
            source,
            extra,
            started_at: now,
            leader_moved_at: None,
        });
        let version = cell.bump_version();
        info!(cell_id = %id, source, extra, version, "cell peer move started");
        Ok(extra)
    }

    /// Replace the moved peer by its extra peer and shrink back.
    pub fn complete_peer_move(&mut self, id: CellId, source: usize) -> CellResult<Option<String>> {
        let cell = self.cell_entry(id)?;
        let Some(pos) = cell.moves.iter().position(|m| m.source == source) else {
            return Ok(None);
        };
        let m = cell.moves.remove(pos);
        let extra = cell.peers.remove(m.extra);
        let dropped = std::mem::replace(&mut cell.peers[source], extra).address;
        for other in cell.moves.iter_mut().filter(|o| o.extra > m.extra) {
            other.extra -= 1;
        }
        let version = cell.bump_version();
        // The surviving peers keep their roles under the new version.
        for peer in cell.peers.iter_mut().filter(|p| p.is_assigned()) {
            peer.config_version = version;
        }
        info!(cell_id = %id, source, dropped = ?dropped, version, "cell peer move completed");
        Ok(dropped)
    }

    /// Undo a move: drop the extra peer and keep the original.
    pub fn abort_peer_move(&mut self, id: CellId, source: usize) -> CellResult<Option<String>> {
        let cell = self.cell_entry(id)?;
        let Some(pos) = cell.moves.iter().position(|m| m.source == source) else {
            return Ok(None);
        };
        let m = cell.moves.remove(pos);
        let extra = cell.peers.remove(m.extra);
        for other in cell.moves.iter_mut().filter(|o| o.extra > m.extra) {
            other.extra -= 1;
        }
        let version = cell.bump_version();
        let leader_was_extra = extra.state == PeerState::Leading;
        for peer in cell.peers.iter_mut().filter(|p| p.is_assigned()) {
            peer.config_version = version;
        }
        if leader_was_extra {
            if let Some(peer) = cell.peers.get_mut(source) {
                peer.state = PeerState::Following;
            }
            self.rows.invalidate(id);
        }
        info!(cell_id = %id, source, version, "cell peer move aborted");
        Ok(extra.address)
    }

    // ── Maintenance ────────────────────────────────────────────────

    /// One store tick: finish tablet transitions, advance bundle removals
    /// and tablet actions.
    pub fn tick(&mut self, now: Millis) -> CellResult<()> {
        self.complete_tablet_transitions(now)?;
        self.process_bundle_removals(now)?;
        self.advance_tablet_actions(now)?;
        Ok(())
    }

    // ── Orchid ─────────────────────────────────────────────────────

    pub fn cell_orchid(&self, id: CellId) -> Option<Value> {
        let cell = self.cells.get(&id)?;
        let bundle = self.bundle(cell.bundle_id);
        let tablet_count: usize = self
            .tables
            .values()
            .map(|t| t.tablets.iter().filter(|tb| tb.cell_id == Some(id)).count())
            .sum();
        Some(json!({
            "id": cell.id,
            "bundle": bundle.map(|b| b.name.as_str()),
            "health": cell.health(),
            "life_stage": cell.life_stage,
            "config_version": cell.config_version,
            "prerequisite_transaction_id": cell.prerequisite_transaction_id,
            "max_changelog_id": cell.max_changelog_id,
            "max_snapshot_id": cell.max_snapshot_id,
            "tablet_count": tablet_count,
            "peers": cell.peers.iter().enumerate().map(|(i, p)| json!({
                "address": p.address,
                "state": p.state,
                "config_version": p.config_version,
                "extra": cell.is_extra_peer(i),
            })).collect::<Vec<_>>(),
        }))
    }

    pub fn bundle_orchid(&self, name: &str) -> Option<Value> {
        let bundle = self.bundle_by_name(name).ok()?;
        Some(json!({
            "id": bundle.id.to_string(),
            "name": bundle.name,
            "options": bundle.options,
            "dynamic_options": bundle.dynamic_options,
            "node_tag_filter": bundle.node_tag_filter.as_str(),
            "balancer_config": bundle.balancer_config,
            "removal": bundle.removal,
            "ref_count": bundle.ref_count,
            "resource_limits": bundle.resource_limits,
            "resource_usage": bundle.resource_usage,
            "tablet_cell_ids": self.bundle_cells(bundle.id),
        }))
    }
}

/// Grow or keep the peer list; shrinking requires removing the cell.
fn resize_peers(cell: &mut Cell, target: usize) -> CellResult<()> {
    if target == 0 {
        return Err(CellError::Configuration("peer_count must be at least 1".into()));
    }
    let current = cell.peers.len() - cell.moves.len();
    if target < current {
        return Err(CellError::InvalidState(
            "peer count can only be decreased by removing the cell".into(),
        ));
    }
    if target > current {
        cell.peers.resize(target, Peer::default());
        let version = cell.bump_version();
        info!(cell_id = %cell.id, peers = target, version, "cell peer count raised");
    }
    Ok(())
}

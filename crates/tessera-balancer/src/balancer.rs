//! Cell balancer tick.
//!
//! Each tick walks every cell and, in order:
//!
//! 1. judges each assigned peer against its node (lost, ineligible,
//!    leaving, healthy) and revokes or starts a move accordingly;
//! 2. advances in-flight peer moves (leader hand-off, extra drop, timeout);
//! 3. places unassigned peers of running cells on the best ranked node;
//! 4. occasionally moves one peer to even out per-bundle and total load;
//! 5. runs the decommissioner and rewrites the registry's slot tables.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use tessera_cells::{CellResult, CellStore, LifeStage};
use tessera_core::config::TabletManagerConfig;
use tessera_core::{BundleId, CellId, Millis, PeerState, TagFilter};
use tessera_nodes::{Node, NodeRegistry, TabletSlot};

use crate::decommissioner::Decommissioner;
use crate::events::{BalancerEvent, BalancerEventKind};
use crate::placement::{rank_nodes, SlotLoad};

/// What the balancer thinks of the node a peer sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Healthy,
    /// Missing or offline; tolerated until a timeout.
    Lost,
    /// Banned or outside the bundle filter; revoked at once.
    Ineligible(&'static str),
    /// Decommissioned or refusing tablet cells; drained.
    Leaving,
}

fn judge(node: Option<&Node>, filter: &TagFilter) -> Verdict {
    match node {
        None => Verdict::Lost,
        Some(n) if n.flags.banned => Verdict::Ineligible("node banned"),
        Some(n) if !n.online => Verdict::Lost,
        Some(n) if !filter.matches(&n.tags) => Verdict::Ineligible("node no longer matches bundle tag filter"),
        Some(n) if n.flags.decommissioned || n.flags.disable_tablet_cells => Verdict::Leaving,
        Some(_) => Verdict::Healthy,
    }
}

pub struct CellBalancer {
    config: TabletManagerConfig,
    decommissioner: Decommissioner,
    last_rebalance: Option<Millis>,
}

impl CellBalancer {
    pub fn new(config: TabletManagerConfig) -> Self {
        let decommissioner = Decommissioner::new(config.tablet_cell_decommissioner.clone());
        Self {
            config,
            decommissioner,
            last_rebalance: None,
        }
    }

    pub fn config(&self) -> &TabletManagerConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: TabletManagerConfig) {
        self.decommissioner
            .set_config(config.tablet_cell_decommissioner.clone());
        self.config = config;
    }

    /// Run one balancer pass. A failure on one cell is logged and the pass
    /// continues with the next.
    pub fn tick(
        &mut self,
        store: &mut CellStore,
        registry: &mut NodeRegistry,
        now: Millis,
    ) -> CellResult<Vec<BalancerEvent>> {
        let mut events = Vec::new();

        for cell_id in store.cell_ids() {
            if let Err(e) = self.check_peers(store, registry, cell_id, now, &mut events) {
                warn!(%cell_id, error = %e, "peer check failed");
                continue;
            }
            if let Err(e) = self.advance_moves(store, cell_id, now, &mut events) {
                warn!(%cell_id, error = %e, "peer move failed");
            }
        }

        let mut load = SlotLoad::from_store(store);
        for cell_id in store.cell_ids() {
            if let Err(e) = self.assign_missing(store, registry, &mut load, cell_id, now, &mut events) {
                warn!(%cell_id, error = %e, "peer assignment failed");
            }
        }

        if self.rebalance_due(now) {
            self.last_rebalance = Some(now);
            self.rebalance(store, registry, &mut load, now, &mut events)?;
        }

        events.extend(self.decommissioner.tick(store, now)?);
        sync_slots(store, registry);
        Ok(events)
    }

    // ── Peer checks ────────────────────────────────────────────────

    fn check_peers(
        &self,
        store: &mut CellStore,
        registry: &NodeRegistry,
        cell_id: CellId,
        now: Millis,
        events: &mut Vec<BalancerEvent>,
    ) -> CellResult<()> {
        let Some(cell) = store.cell(cell_id) else {
            return Ok(());
        };
        let Some(bundle) = store.bundle(cell.bundle_id) else {
            return Ok(());
        };
        let running = cell.life_stage == LifeStage::Running;
        let verdicts: Vec<(usize, String, Verdict)> = cell
            .peer_addresses()
            .map(|(peer_id, address)| {
                let verdict = judge(registry.get(address), &bundle.node_tag_filter);
                (peer_id, address.to_string(), verdict)
            })
            .collect();

        if !running {
            // Decommissioning cells only shed peers that cannot stop cleanly.
            let sources: Vec<usize> = cell.moves.iter().map(|m| m.source).collect();
            if !sources.is_empty() {
                for source in sources {
                    store.abort_peer_move(cell_id, source)?;
                }
                return Ok(());
            }
            for (peer_id, address, verdict) in verdicts {
                if let Verdict::Ineligible(reason) = verdict {
                    self.revoke(store, cell_id, peer_id, &address, reason, now, events)?;
                }
            }
            return Ok(());
        }

        for (peer_id, address, verdict) in verdicts {
            let Some(cell) = store.cell(cell_id) else {
                return Ok(());
            };
            let is_extra = cell.is_extra_peer(peer_id);
            let is_moving = cell.is_moving(peer_id);
            let previously_lost = cell.peers[peer_id].lost_since;
            let interrupted = cell
                .moves
                .iter()
                .any(|m| m.source == peer_id && m.leader_moved_at.is_none());
            match verdict {
                Verdict::Healthy => {
                    if let Some(cell) = store.cell_mut(cell_id) {
                        cell.peers[peer_id].lost_since = None;
                    }
                    if interrupted {
                        store.abort_peer_move(cell_id, peer_id)?;
                        info!(%cell_id, peer_id, %address, "node recovered, peer move aborted");
                        events.push(BalancerEvent::new(
                            cell_id,
                            now,
                            BalancerEventKind::MoveAborted { source: peer_id },
                        ));
                        // Peer indices past the dropped extra shifted.
                        return Ok(());
                    }
                }
                Verdict::Lost => {
                    let lost_since = match previously_lost {
                        Some(t) => t,
                        None => {
                            warn!(%cell_id, peer_id, %address, "cell peer lost its node");
                            if let Some(cell) = store.cell_mut(cell_id) {
                                let peer = &mut cell.peers[peer_id];
                                peer.lost_since = Some(now);
                                peer.state = PeerState::None;
                            }
                            now
                        }
                    };
                    let has_leader = store
                        .cell(cell_id)
                        .is_some_and(|c| c.leading_peer().is_some());
                    let timeout = if has_leader {
                        self.config.peer_revocation_timeout_ms
                    } else {
                        self.config
                            .leader_reassignment_timeout_ms
                            .min(self.config.peer_revocation_timeout_ms)
                    };
                    if now.saturating_sub(lost_since) >= timeout {
                        self.revoke(store, cell_id, peer_id, &address, "peer lost", now, events)?;
                    }
                }
                Verdict::Ineligible(reason) => {
                    self.revoke(store, cell_id, peer_id, &address, reason, now, events)?;
                }
                Verdict::Leaving if is_extra => {
                    self.revoke(store, cell_id, peer_id, &address, "extra peer node is leaving", now, events)?;
                }
                Verdict::Leaving if is_moving => {}
                Verdict::Leaving if self.config.decommission_through_extra_peers => {
                    let extra = store.start_peer_move(cell_id, peer_id, now)?;
                    events.push(BalancerEvent::new(
                        cell_id,
                        now,
                        BalancerEventKind::MoveStarted { source: peer_id, extra },
                    ));
                }
                Verdict::Leaving => {
                    self.revoke(store, cell_id, peer_id, &address, "node decommissioned", now, events)?;
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn revoke(
        &self,
        store: &mut CellStore,
        cell_id: CellId,
        peer_id: usize,
        address: &str,
        reason: &str,
        now: Millis,
        events: &mut Vec<BalancerEvent>,
    ) -> CellResult<()> {
        store.revoke_peer(cell_id, peer_id, reason)?;
        events.push(BalancerEvent::new(
            cell_id,
            now,
            BalancerEventKind::PeerRevoked {
                peer_id,
                address: address.to_string(),
                reason: reason.to_string(),
            },
        ));
        Ok(())
    }

    // ── Peer moves ─────────────────────────────────────────────────

    fn advance_moves(
        &self,
        store: &mut CellStore,
        cell_id: CellId,
        now: Millis,
        events: &mut Vec<BalancerEvent>,
    ) -> CellResult<()> {
        let Some(cell) = store.cell(cell_id) else {
            return Ok(());
        };
        if cell.life_stage != LifeStage::Running {
            return Ok(());
        }
        let Some(m) = cell.moves.first().cloned() else {
            return Ok(());
        };
        // One structural change per cell per tick keeps peer indices stable.
        match m.leader_moved_at {
            Some(moved_at) => {
                if now.saturating_sub(moved_at) >= self.config.extra_peer_drop_delay_ms {
                    let dropped = store.complete_peer_move(cell_id, m.source)?;
                    events.push(BalancerEvent::new(
                        cell_id,
                        now,
                        BalancerEventKind::MoveCompleted { source: m.source, dropped },
                    ));
                }
            }
            None => {
                let extra = &cell.peers[m.extra];
                let extra_ready = extra.is_assigned()
                    && extra.state.is_active()
                    && extra.config_version == cell.config_version;
                let source_leads = cell.leading_peer() == Some(m.source);
                if extra_ready {
                    if source_leads && !store.transfer_leadership(cell_id, m.extra)? {
                        debug!(%cell_id, extra = m.extra, "extra peer not ready to lead yet");
                        return Ok(());
                    }
                    if let Some(cell) = store.cell_mut(cell_id) {
                        if let Some(mv) = cell.moves.iter_mut().find(|x| x.source == m.source) {
                            mv.leader_moved_at = Some(now);
                        }
                    }
                    events.push(BalancerEvent::new(
                        cell_id,
                        now,
                        BalancerEventKind::LeaderMoved { source: m.source, extra: m.extra },
                    ));
                } else if now.saturating_sub(m.started_at)
                    >= self.config.decommissioned_leader_reassignment_timeout_ms
                {
                    let address = cell.peers[m.source].address.clone().unwrap_or_default();
                    warn!(%cell_id, source = m.source, "extra peer did not come up in time");
                    store.abort_peer_move(cell_id, m.source)?;
                    events.push(BalancerEvent::new(
                        cell_id,
                        now,
                        BalancerEventKind::MoveAborted { source: m.source },
                    ));
                    self.revoke(
                        store,
                        cell_id,
                        m.source,
                        &address,
                        "leader reassignment timed out",
                        now,
                        events,
                    )?;
                }
            }
        }
        Ok(())
    }

    // ── Placement ──────────────────────────────────────────────────

    fn assign_missing(
        &self,
        store: &mut CellStore,
        registry: &NodeRegistry,
        load: &mut SlotLoad,
        cell_id: CellId,
        now: Millis,
        events: &mut Vec<BalancerEvent>,
    ) -> CellResult<()> {
        let balance_total = self.config.tablet_cell_balancer.enable_tablet_cell_balancer;
        loop {
            let Some(cell) = store.cell(cell_id) else {
                return Ok(());
            };
            if cell.life_stage != LifeStage::Running {
                return Ok(());
            }
            let Some(peer_id) = cell.peers.iter().position(|p| !p.is_assigned()) else {
                return Ok(());
            };
            let Some(bundle) = store.bundle(cell.bundle_id) else {
                return Ok(());
            };
            let bundle_id = bundle.id;
            let Some(address) = rank_nodes(cell, bundle, registry, load, balance_total)
                .into_iter()
                .next()
            else {
                debug!(%cell_id, peer_id, "no eligible node for cell peer");
                return Ok(());
            };
            store.assign_peer(cell_id, peer_id, &address, now)?;
            load.add(bundle_id, &address);
            events.push(BalancerEvent::new(
                cell_id,
                now,
                BalancerEventKind::PeerAssigned { peer_id, address },
            ));
        }
    }

    // ── Rebalancing ────────────────────────────────────────────────

    fn rebalance_due(&self, now: Millis) -> bool {
        let cfg = &self.config.tablet_cell_balancer;
        cfg.enable_tablet_cell_balancer
            && self
                .last_rebalance
                .is_none_or(|t| now.saturating_sub(t) >= cfg.rebalance_wait_time_ms)
    }

    /// Cells of `bundle` with a peer on `from` that could move to `to`,
    /// paired with that peer index. Followers sort first.
    fn movable_peers(store: &CellStore, bundle: BundleId, from: &str, to: &str) -> Vec<(CellId, usize)> {
        let mut found: Vec<(bool, CellId, usize)> = store
            .cells()
            .filter(|c| c.bundle_id == bundle && c.life_stage == LifeStage::Running && c.moves.is_empty())
            .filter(|c| !c.peer_addresses().any(|(_, a)| a == to))
            .filter_map(|c| {
                c.peer_addresses()
                    .find(|(_, a)| *a == from)
                    .map(|(peer_id, _)| (c.peers[peer_id].state == PeerState::Leading, c.id, peer_id))
            })
            .collect();
        found.sort();
        found.into_iter().map(|(_, cell, peer)| (cell, peer)).collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn move_peer(
        &self,
        store: &mut CellStore,
        load: &mut SlotLoad,
        bundle: BundleId,
        cell_id: CellId,
        peer_id: usize,
        from: &str,
        to: &str,
        now: Millis,
        events: &mut Vec<BalancerEvent>,
    ) -> CellResult<()> {
        info!(%cell_id, peer_id, from, to, "rebalancing cell peer");
        self.revoke(store, cell_id, peer_id, from, "rebalancing", now, events)?;
        load.remove(bundle, from);
        store.assign_peer(cell_id, peer_id, to, now)?;
        load.add(bundle, to);
        events.push(BalancerEvent::new(
            cell_id,
            now,
            BalancerEventKind::PeerAssigned {
                peer_id,
                address: to.to_string(),
            },
        ));
        Ok(())
    }

    fn rebalance(
        &self,
        store: &mut CellStore,
        registry: &NodeRegistry,
        load: &mut SlotLoad,
        now: Millis,
        events: &mut Vec<BalancerEvent>,
    ) -> CellResult<()> {
        let bundles: Vec<(BundleId, TagFilter)> = store
            .bundles()
            .filter(|b| b.balancer_config.enable_cell_balancer && !b.is_removing())
            .map(|b| (b.id, b.node_tag_filter.clone()))
            .collect();

        // Per-bundle spread first.
        for (bundle, filter) in &bundles {
            let nodes: Vec<&Node> = registry.tablet_cell_candidates(filter).collect();
            let Some(max) = nodes.iter().max_by_key(|n| (load.bundle(*bundle, &n.address), std::cmp::Reverse(n.address.clone()))) else {
                continue;
            };
            let Some(min) = nodes
                .iter()
                .filter(|n| n.tablet_slot_count > load.total(&n.address))
                .min_by_key(|n| (load.bundle(*bundle, &n.address), n.address.clone()))
            else {
                continue;
            };
            if load.bundle(*bundle, &max.address) <= load.bundle(*bundle, &min.address) + 1 {
                continue;
            }
            let (from, to) = (max.address.clone(), min.address.clone());
            if let Some(&(cell_id, peer_id)) = Self::movable_peers(store, *bundle, &from, &to).first() {
                self.move_peer(store, load, *bundle, cell_id, peer_id, &from, &to, now, events)?;
            }
        }

        // Then total spread, only through moves that keep every bundle balanced.
        let any = TagFilter::any();
        let nodes: Vec<&Node> = registry.tablet_cell_candidates(&any).collect();
        let Some(max) = nodes.iter().max_by_key(|n| (load.total(&n.address), std::cmp::Reverse(n.address.clone()))) else {
            return Ok(());
        };
        let Some(min) = nodes
            .iter()
            .filter(|n| n.tablet_slot_count > load.total(&n.address))
            .min_by_key(|n| (load.total(&n.address), n.address.clone()))
        else {
            return Ok(());
        };
        if load.total(&max.address) <= load.total(&min.address) + 1 {
            return Ok(());
        }
        let (from, to) = (max.address.clone(), min.address.clone());
        for (bundle, filter) in &bundles {
            if !filter.matches(&min.tags) || load.bundle(*bundle, &from) <= load.bundle(*bundle, &to) {
                continue;
            }
            if let Some(&(cell_id, peer_id)) = Self::movable_peers(store, *bundle, &from, &to).first() {
                self.move_peer(store, load, *bundle, cell_id, peer_id, &from, &to, now, events)?;
                break;
            }
        }
        Ok(())
    }
}

/// Rebuild every node's slot table from the cell store.
pub fn sync_slots(store: &CellStore, registry: &mut NodeRegistry) {
    let mut slots: BTreeMap<String, Vec<TabletSlot>> = BTreeMap::new();
    for cell in store.cells() {
        for (peer_id, address) in cell.peer_addresses() {
            slots.entry(address.to_string()).or_default().push(TabletSlot {
                cell_id: cell.id,
                peer_id,
                state: cell.peers[peer_id].state,
            });
        }
    }
    registry.sync_tablet_slots(slots);
}

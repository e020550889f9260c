//! Node registry: tracks cluster node state.
//!
//! Keeps nodes ordered by address so every iteration (and therefore every
//! placement decision built on it) is deterministic. Nodes that miss
//! heartbeats for longer than the heartbeat timeout go offline; the caller
//! receives their addresses and aborts whatever ran there.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use tessera_core::{validate_tag, CellId, CoreResult, Millis, PeerState, ResourceVector, TagFilter};

use crate::node::{Node, NodeFlag, TabletSlot};

pub struct NodeRegistry {
    nodes: BTreeMap<String, Node>,
    heartbeat_timeout: Duration,
    default_tablet_slots: usize,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            heartbeat_timeout: Duration::from_secs(60),
            default_tablet_slots: 4,
        }
    }

    /// Set how long a node may stay silent before it is considered lost.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the tablet slot count given to newly registered nodes.
    pub fn with_default_tablet_slots(mut self, slots: usize) -> Self {
        self.default_tablet_slots = slots;
        self
    }

    // ── Membership ─────────────────────────────────────────────────

    /// Add or refresh a node. Returns true if the node is new.
    ///
    /// Brings the node online; administrative flags are left untouched.
    pub fn upsert_node(
        &mut self,
        address: &str,
        tags: BTreeSet<String>,
        limits: ResourceVector,
        now: Millis,
    ) -> CoreResult<bool> {
        for tag in &tags {
            validate_tag(tag)?;
        }
        match self.nodes.get_mut(address) {
            Some(node) => {
                node.tags = tags;
                node.limits = limits;
                node.last_heartbeat = now;
                if !node.online {
                    info!(%address, "node back online");
                }
                node.online = true;
                node.offline_since = None;
                Ok(false)
            }
            None => {
                let node = Node::new(address, tags, limits, self.default_tablet_slots, now);
                self.nodes.insert(address.to_string(), node);
                info!(%address, "node registered");
                Ok(true)
            }
        }
    }

    /// Refresh liveness and reported usage. Unknown nodes are ignored.
    pub fn heartbeat(&mut self, address: &str, usage: Option<ResourceVector>, now: Millis) -> bool {
        match self.nodes.get_mut(address) {
            Some(node) => {
                node.last_heartbeat = now;
                if !node.online {
                    info!(%address, "node back online");
                    node.online = true;
                    node.offline_since = None;
                }
                if let Some(usage) = usage {
                    node.usage = usage;
                }
                debug!(%address, "heartbeat received");
                true
            }
            None => {
                warn!(%address, "heartbeat from unknown node");
                false
            }
        }
    }

    /// Take nodes silent for longer than the heartbeat timeout offline.
    ///
    /// Returns the addresses that went offline in this call. Their usage is
    /// dropped: from the scheduler's viewpoint every job there is aborted.
    pub fn check_liveness(&mut self, now: Millis) -> Vec<String> {
        let timeout = self.heartbeat_timeout.as_millis() as Millis;
        let mut lost = Vec::new();
        for node in self.nodes.values_mut() {
            if node.online && now.saturating_sub(node.last_heartbeat) > timeout {
                node.online = false;
                node.offline_since = Some(now);
                node.usage = ResourceVector::zero();
                warn!(address = %node.address, "node heartbeat lost");
                lost.push(node.address.clone());
            }
        }
        lost
    }

    pub fn remove_node(&mut self, address: &str) -> Option<Node> {
        let removed = self.nodes.remove(address);
        if removed.is_some() {
            info!(%address, "node removed");
        }
        removed
    }

    // ── Administrative state ───────────────────────────────────────

    /// Set an administrative flag. Returns whether the value changed;
    /// unknown addresses are ignored.
    pub fn set_flag(&mut self, address: &str, flag: NodeFlag, value: bool) -> bool {
        let Some(node) = self.nodes.get_mut(address) else {
            debug!(%address, ?flag, "set_flag on unknown node ignored");
            return false;
        };
        if node.flags.get(flag) == value {
            return false;
        }
        node.flags.set(flag, value);
        info!(%address, ?flag, value, "node flag changed");
        true
    }

    /// Clamp a node's limits to `overrides` (or clear the clamp with `None`).
    pub fn set_overrides(&mut self, address: &str, overrides: Option<ResourceVector>) {
        if let Some(node) = self.nodes.get_mut(address) {
            info!(%address, overrides = ?overrides.as_ref().map(|o| o.to_string()), "node resource overrides set");
            node.overrides = overrides;
        }
    }

    pub fn set_tablet_slot_count(&mut self, address: &str, slots: usize) {
        if let Some(node) = self.nodes.get_mut(address) {
            node.tablet_slot_count = slots;
        }
    }

    // ── Lookups ────────────────────────────────────────────────────

    pub fn get(&self, address: &str) -> Option<&Node> {
        self.nodes.get(address)
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut Node> {
        self.nodes.get_mut(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.nodes.contains_key(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Online, non-banned nodes whose tags satisfy `filter`.
    pub fn iter_feasible<'a>(&'a self, filter: &'a TagFilter) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes
            .values()
            .filter(move |n| n.is_available() && filter.matches(&n.tags))
    }

    /// Feasible nodes that may host cell peers.
    pub fn tablet_cell_candidates<'a>(&'a self, filter: &'a TagFilter) -> impl Iterator<Item = &'a Node> + 'a {
        self.iter_feasible(filter).filter(|n| n.accepts_tablet_cells())
    }

    /// Feasible nodes that may run scheduler jobs.
    pub fn schedulable<'a>(&'a self, filter: &'a TagFilter) -> impl Iterator<Item = &'a Node> + 'a {
        self.iter_feasible(filter).filter(|n| n.accepts_scheduler_jobs())
    }

    /// Sum of effective limits over schedulable nodes matching `filter`.
    pub fn total_limits(&self, filter: &TagFilter) -> ResourceVector {
        self.schedulable(filter)
            .fold(ResourceVector::zero(), |acc, n| acc.add(&n.effective_limits()))
    }

    // ── Tablet slots ───────────────────────────────────────────────

    /// Occupy a slot for `(cell, peer)`. Returns false if the node is unknown,
    /// full, or already hosts that peer.
    pub fn assign_slot(&mut self, address: &str, cell_id: CellId, peer_id: usize) -> bool {
        let Some(node) = self.nodes.get_mut(address) else {
            return false;
        };
        if node.free_tablet_slots() == 0
            || node
                .tablet_slots
                .iter()
                .any(|s| s.cell_id == cell_id && s.peer_id == peer_id)
        {
            return false;
        }
        node.tablet_slots.push(TabletSlot {
            cell_id,
            peer_id,
            state: PeerState::None,
        });
        true
    }

    pub fn release_slot(&mut self, address: &str, cell_id: CellId, peer_id: usize) -> bool {
        let Some(node) = self.nodes.get_mut(address) else {
            return false;
        };
        let before = node.tablet_slots.len();
        node.tablet_slots
            .retain(|s| !(s.cell_id == cell_id && s.peer_id == peer_id));
        before != node.tablet_slots.len()
    }

    /// Replace every node's slot table with `slots`, keyed by address.
    /// Nodes missing from `slots` end up with no slots.
    pub fn sync_tablet_slots(&mut self, mut slots: BTreeMap<String, Vec<TabletSlot>>) {
        for node in self.nodes.values_mut() {
            node.tablet_slots = slots.remove(&node.address).unwrap_or_default();
        }
        for address in slots.keys() {
            debug!(%address, "slots for unknown node dropped");
        }
    }

    pub fn set_slot_state(&mut self, address: &str, cell_id: CellId, peer_id: usize, state: PeerState) {
        if let Some(node) = self.nodes.get_mut(address) {
            for slot in &mut node.tablet_slots {
                if slot.cell_id == cell_id && slot.peer_id == peer_id {
                    slot.state = state;
                }
            }
        }
    }

    // ── Scheduler usage ────────────────────────────────────────────

    pub fn add_usage(&mut self, address: &str, delta: &ResourceVector) {
        if let Some(node) = self.nodes.get_mut(address) {
            node.usage = node.usage.add(delta);
        }
    }

    pub fn release_usage(&mut self, address: &str, delta: &ResourceVector) {
        if let Some(node) = self.nodes.get_mut(address) {
            node.usage = node.usage.sub_saturating(delta);
        }
    }

    /// Refresh overcommit timers and return nodes overcommitted for longer
    /// than `allowed`.
    pub fn update_overcommit(&mut self, now: Millis, allowed: Duration) -> Vec<String> {
        let allowed = allowed.as_millis() as Millis;
        let mut expired = Vec::new();
        for node in self.nodes.values_mut() {
            if node.is_overcommitted() {
                let since = *node.overcommit_since.get_or_insert(now);
                if now.saturating_sub(since) >= allowed {
                    expired.push(node.address.clone());
                }
            } else {
                node.overcommit_since = None;
            }
        }
        expired
    }

    pub fn orchid(&self) -> Value {
        let nodes: serde_json::Map<String, Value> = self
            .nodes
            .values()
            .map(|n| {
                (
                    n.address.clone(),
                    json!({
                        "state": n.state(),
                        "tags": n.tags,
                        "flags": n.flags,
                        "resource_limits": n.effective_limits(),
                        "resource_usage": n.usage,
                        "tablet_slots": n.tablet_slots,
                        "last_heartbeat": n.last_heartbeat,
                    }),
                )
            })
            .collect();
        Value::Object(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn registry_with(nodes: &[(&str, &[&str])]) -> NodeRegistry {
        let mut reg = NodeRegistry::new().with_heartbeat_timeout(Duration::from_secs(10));
        for (addr, t) in nodes {
            reg.upsert_node(addr, tags(t), ResourceVector::cpu(10.0), 0).unwrap();
        }
        reg
    }

    #[test]
    fn upsert_rejects_invalid_tags() {
        let mut reg = NodeRegistry::new();
        assert!(reg.upsert_node("n1", tags(&["custom!"]), ResourceVector::cpu(1.0), 0).is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn upsert_keeps_admin_flags() {
        let mut reg = registry_with(&[("n1", &[])]);
        assert!(reg.set_flag("n1", NodeFlag::Banned, true));
        assert!(!reg.upsert_node("n1", tags(&[]), ResourceVector::cpu(10.0), 5).unwrap());
        assert!(reg.get("n1").unwrap().flags.banned);
    }

    #[test]
    fn unknown_addresses_are_ignored() {
        let mut reg = NodeRegistry::new();
        assert!(!reg.set_flag("ghost", NodeFlag::Banned, true));
        reg.set_overrides("ghost", Some(ResourceVector::cpu(1.0)));
        assert!(!reg.heartbeat("ghost", None, 0));
        assert!(reg.remove_node("ghost").is_none());
    }

    #[test]
    fn feasible_nodes_honor_filter_and_ban() {
        let mut reg = registry_with(&[("a", &["custom"]), ("b", &[]), ("c", &["custom"])]);
        reg.set_flag("c", NodeFlag::Banned, true);
        let filter = TagFilter::parse("custom").unwrap();
        let feasible: Vec<_> = reg.iter_feasible(&filter).map(|n| n.address.clone()).collect();
        assert_eq!(feasible, vec!["a"]);

        let negated = TagFilter::parse("!custom").unwrap();
        let feasible: Vec<_> = reg.iter_feasible(&negated).map(|n| n.address.clone()).collect();
        assert_eq!(feasible, vec!["b"]);
    }

    #[test]
    fn liveness_timeout_takes_node_offline_once() {
        let mut reg = registry_with(&[("a", &[]), ("b", &[])]);
        reg.add_usage("a", &ResourceVector::cpu(3.0));
        reg.heartbeat("b", None, 8_000);
        assert_eq!(reg.check_liveness(12_000), vec!["a".to_string()]);
        assert!(reg.check_liveness(13_000).is_empty());
        assert!(reg.get("a").unwrap().usage.is_zero());
        assert_eq!(reg.total_limits(&TagFilter::any()).get("cpu"), 10.0);

        reg.heartbeat("a", None, 14_000);
        assert!(reg.get("a").unwrap().online);
    }

    #[test]
    fn tablet_slots_are_bounded() {
        let mut reg = registry_with(&[("a", &[])]);
        reg.set_tablet_slot_count("a", 1);
        let c1 = CellId::new();
        let c2 = CellId::new();
        assert!(reg.assign_slot("a", c1, 0));
        assert!(!reg.assign_slot("a", c2, 0));
        assert!(reg.release_slot("a", c1, 0));
        assert!(reg.assign_slot("a", c2, 0));
    }

    #[test]
    fn overcommit_window_expires() {
        let mut reg = registry_with(&[("a", &[])]);
        reg.add_usage("a", &ResourceVector::cpu(12.0));
        assert!(reg.update_overcommit(1_000, Duration::from_secs(5)).is_empty());
        assert_eq!(reg.update_overcommit(6_000, Duration::from_secs(5)), vec!["a".to_string()]);
        reg.release_usage("a", &ResourceVector::cpu(4.0));
        assert!(reg.update_overcommit(7_000, Duration::from_secs(5)).is_empty());
        assert!(reg.get("a").unwrap().overcommit_since.is_none());
    }
}

//! Node ranking for cell peers.
//!
//! A node is eligible for a peer when it is online, not banned, accepts
//! tablet cells, satisfies the bundle's tag filter, has a free tablet slot
//! and does not already host another peer of the same cell. Eligible nodes
//! are ordered by the bundle's peer count on them, then (when total
//! balancing is on) by their overall peer count, then by address. Always
//! taking the first keeps per-bundle counts within one of each other.

use std::collections::BTreeMap;

use tessera_cells::{Bundle, Cell, CellStore};
use tessera_core::BundleId;
use tessera_nodes::NodeRegistry;

/// Peer counts per node, overall and per bundle.
#[derive(Debug, Clone, Default)]
pub struct SlotLoad {
    total: BTreeMap<String, usize>,
    per_bundle: BTreeMap<(BundleId, String), usize>,
}

impl SlotLoad {
    pub fn from_store(store: &CellStore) -> Self {
        let mut load = Self::default();
        for cell in store.cells() {
            for (_, address) in cell.peer_addresses() {
                load.add(cell.bundle_id, address);
            }
        }
        load
    }

    pub fn total(&self, address: &str) -> usize {
        self.total.get(address).copied().unwrap_or(0)
    }

    pub fn bundle(&self, bundle: BundleId, address: &str) -> usize {
        self.per_bundle
            .get(&(bundle, address.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn add(&mut self, bundle: BundleId, address: &str) {
        *self.total.entry(address.to_string()).or_default() += 1;
        *self.per_bundle.entry((bundle, address.to_string())).or_default() += 1;
    }

    pub fn remove(&mut self, bundle: BundleId, address: &str) {
        if let Some(n) = self.total.get_mut(address) {
            *n = n.saturating_sub(1);
        }
        if let Some(n) = self.per_bundle.get_mut(&(bundle, address.to_string())) {
            *n = n.saturating_sub(1);
        }
    }
}

/// Nodes able to take one more peer of `cell`, best first.
pub fn rank_nodes(
    cell: &Cell,
    bundle: &Bundle,
    registry: &NodeRegistry,
    load: &SlotLoad,
    balance_total: bool,
) -> Vec<String> {
    let mut ranked: Vec<(usize, usize, String)> = registry
        .tablet_cell_candidates(&bundle.node_tag_filter)
        .filter(|node| !cell.peer_addresses().any(|(_, a)| a == node.address))
        .filter(|node| node.tablet_slot_count > load.total(&node.address))
        .map(|node| {
            let total = if balance_total { load.total(&node.address) } else { 0 };
            (load.bundle(bundle.id, &node.address), total, node.address.clone())
        })
        .collect();
    ranked.sort();
    ranked.into_iter().map(|(_, _, address)| address).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tessera_cells::BundleOptions;
    use tessera_core::{Acl, ResourceVector, ROOT_USER};

    fn registry(nodes: &[(&str, &[&str])]) -> NodeRegistry {
        let mut reg = NodeRegistry::new().with_default_tablet_slots(2);
        for (addr, tags) in nodes {
            let tags: BTreeSet<String> = tags.iter().map(|t| t.to_string()).collect();
            reg.upsert_node(addr, tags, ResourceVector::cpu(4.0), 0).unwrap();
        }
        reg
    }

    #[test]
    fn ranks_by_bundle_load_then_address() {
        let mut store = CellStore::in_memory().unwrap();
        store
            .create_bundle(ROOT_USER, "b", BundleOptions::default(), Acl::default(), 0)
            .unwrap();
        store.set_bundle_node_tag_filter(ROOT_USER, "b", "ssd").unwrap();
        let c1 = store.create_cell(ROOT_USER, "b", 0).unwrap();
        let c2 = store.create_cell(ROOT_USER, "b", 0).unwrap();
        store.assign_peer(c1, 0, "n2", 0).unwrap();

        let reg = registry(&[("n1", &["ssd"]), ("n2", &["ssd"]), ("n3", &["hdd"])]);
        let load = SlotLoad::from_store(&store);
        let bundle = store.bundle_by_name("b").unwrap();
        let ranked = rank_nodes(store.cell(c2).unwrap(), bundle, &reg, &load, true);
        assert_eq!(ranked, vec!["n1".to_string(), "n2".to_string()]);

        // A cell never gets two peers on one node.
        let ranked = rank_nodes(store.cell(c1).unwrap(), bundle, &reg, &load, true);
        assert_eq!(ranked, vec!["n1".to_string()]);
    }
}

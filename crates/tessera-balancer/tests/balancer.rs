//! Balancer convergence tests. A `Cluster` drives the balancer, the node
//! agent and the store tick in lock step, 100 ms per step.

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use serde_json::json;

use tessera_balancer::{settle_peers, BalancerEvent, BalancerEventKind, CellBalancer};
use tessera_cells::{BundleOptions, CellHealth, CellStore, DynamicBundleOptions, LifeStage};
use tessera_core::config::TabletManagerConfig;
use tessera_core::{Acl, CellId, ResourceVector, ROOT_USER};
use tessera_nodes::{NodeFlag, NodeRegistry};

const STEP_MS: u64 = 100;

struct Cluster {
    store: CellStore,
    registry: NodeRegistry,
    balancer: CellBalancer,
    now: u64,
    events: Vec<BalancerEvent>,
}

fn tags(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|t| t.to_string()).collect()
}

impl Cluster {
    fn new(config: TabletManagerConfig, nodes: &[&str]) -> Self {
        let mut registry = NodeRegistry::new().with_default_tablet_slots(4);
        for address in nodes {
            registry
                .upsert_node(address, tags(&[]), ResourceVector::cpu(8.0), 0)
                .unwrap();
        }
        Self {
            store: CellStore::in_memory().unwrap().with_snapshot_threshold(3),
            registry,
            balancer: CellBalancer::new(config),
            now: 0,
            events: Vec::new(),
        }
    }

    fn bundle(&mut self, name: &str, peer_count: usize, cells: usize) -> Vec<CellId> {
        let options = BundleOptions {
            peer_count,
            ..Default::default()
        };
        self.store
            .create_bundle(ROOT_USER, name, options, Acl::default(), self.now)
            .unwrap();
        (0..cells)
            .map(|_| self.store.create_cell(ROOT_USER, name, self.now).unwrap())
            .collect()
    }

    fn step(&mut self) {
        self.now += STEP_MS;
        let events = self
            .balancer
            .tick(&mut self.store, &mut self.registry, self.now)
            .unwrap();
        self.events.extend(events);
        settle_peers(&mut self.store, &self.registry).unwrap();
        self.store.tick(self.now).unwrap();
    }

    fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Step until every cell is good. Returns the number of steps taken.
    fn converge(&mut self, max_steps: usize) -> Option<usize> {
        for i in 0..max_steps {
            if self.all_good() {
                return Some(i);
            }
            self.step();
        }
        self.all_good().then_some(max_steps)
    }

    /// Every cell is good with no peer move in flight.
    fn all_good(&self) -> bool {
        self.store
            .cells()
            .all(|c| c.health() == CellHealth::Good && c.moves.is_empty())
    }

    fn health(&self, cell: CellId) -> CellHealth {
        self.store.cell(cell).unwrap().health()
    }

    fn addresses(&self, cell: CellId) -> Vec<String> {
        self.store
            .cell(cell)
            .unwrap()
            .peer_addresses()
            .map(|(_, a)| a.to_string())
            .collect()
    }

    fn leader_address(&self, cell: CellId) -> Option<String> {
        let cell = self.store.cell(cell).unwrap();
        cell.leading_peer()
            .and_then(|p| cell.peers[p].address.clone())
    }

    fn peers_per_node(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = self
            .registry
            .iter()
            .filter(|n| n.accepts_tablet_cells())
            .map(|n| (n.address.clone(), 0))
            .collect();
        for cell in self.store.cells() {
            for (_, address) in cell.peer_addresses() {
                *counts.entry(address.to_string()).or_default() += 1;
            }
        }
        counts
    }

    fn saw(&self, pred: impl Fn(&BalancerEventKind) -> bool) -> bool {
        self.events.iter().any(|e| pred(&e.kind))
    }
}

fn rows(n: usize) -> Vec<(String, serde_json::Value)> {
    (0..n).map(|i| (format!("k{i}"), json!({ "v": i }))).collect()
}

#[test]
fn peers_spread_across_nodes_and_reach_good_health() {
    let mut cluster = Cluster::new(TabletManagerConfig::default(), &["n1", "n2", "n3"]);
    let cells = cluster.bundle("b", 3, 2);
    assert!(cluster.converge(10).is_some());

    for cell in &cells {
        let addresses: BTreeSet<String> = cluster.addresses(*cell).into_iter().collect();
        assert_eq!(addresses.len(), 3, "one peer per node");
    }
    assert!(cluster.peers_per_node().values().all(|&n| n == 2));
    let slots: usize = cluster.registry.iter().map(|n| n.tablet_slots.len()).sum();
    assert_eq!(slots, 6);
}

#[test]
fn decommission_through_extra_peers_keeps_rows_readable() {
    let config = TabletManagerConfig {
        decommission_through_extra_peers: true,
        extra_peer_drop_delay_ms: 500,
        ..Default::default()
    };
    let mut cluster = Cluster::new(config, &["n1", "n2"]);
    let cell = cluster.bundle("b", 1, 1)[0];
    assert!(cluster.converge(5).is_some());

    cluster
        .store
        .create_table(ROOT_USER, "//t", "b", "tmp", vec![], false, cluster.now)
        .unwrap();
    cluster.store.mount_table("//t", Some(cell), false, cluster.now).unwrap();
    cluster.step();
    cluster.store.insert_rows("//t", rows(5), cluster.now).unwrap();

    let original = cluster.leader_address(cell).unwrap();
    cluster
        .registry
        .set_flag(&original, NodeFlag::Decommissioned, true);

    let mut max_peers = 0;
    for _ in 0..20 {
        cluster.step();
        max_peers = max_peers.max(cluster.store.cell(cell).unwrap().peers.len());
        assert_eq!(cluster.store.select_all("//t").unwrap().len(), 5);
    }

    assert_eq!(max_peers, 2);
    let remaining = cluster.addresses(cell);
    assert_eq!(remaining.len(), 1);
    assert_ne!(remaining[0], original);
    assert_eq!(cluster.leader_address(cell), Some(remaining[0].clone()));
    assert_eq!(cluster.health(cell), CellHealth::Good);
    assert!(cluster.saw(|k| matches!(k, BalancerEventKind::MoveStarted { source: 0, .. })));
    assert!(cluster.saw(|k| matches!(k, BalancerEventKind::LeaderMoved { .. })));
    assert!(cluster.saw(|k| matches!(
        k,
        BalancerEventKind::MoveCompleted { dropped: Some(d), .. } if *d == original
    )));
    assert!(cluster.registry.get(&original).unwrap().tablet_slots.is_empty());
}

#[test]
fn prerequisite_abort_mid_move_drops_the_extra_peer() {
    let config = TabletManagerConfig {
        decommission_through_extra_peers: true,
        ..Default::default()
    };
    let mut cluster = Cluster::new(config, &["n1", "n2"]);
    let cell = cluster.bundle("b", 1, 1)[0];
    assert!(cluster.converge(5).is_some());

    let original = cluster.leader_address(cell).unwrap();
    cluster
        .registry
        .set_flag(&original, NodeFlag::Decommissioned, true);
    cluster.step();
    assert_eq!(cluster.store.cell(cell).unwrap().peers.len(), 2);

    cluster.store.abort_prerequisite_transaction(cell).unwrap();
    let aborted = cluster.store.cell(cell).unwrap();
    assert_eq!(aborted.peers.len(), 1);
    assert!(aborted.moves.is_empty());

    assert!(cluster.converge(50).is_some());
    assert_eq!(cluster.store.cell(cell).unwrap().peers.len(), 1);
    assert_ne!(cluster.leader_address(cell), Some(original));
    assert_eq!(cluster.health(cell), CellHealth::Good);
}

#[test]
fn interrupted_decommission_restores_original_peer() {
    let config = TabletManagerConfig {
        decommission_through_extra_peers: true,
        ..Default::default()
    };
    let mut cluster = Cluster::new(config, &["n1", "n2"]);
    let cell = cluster.bundle("b", 1, 1)[0];
    assert!(cluster.converge(5).is_some());
    let original = cluster.leader_address(cell).unwrap();

    cluster
        .registry
        .set_flag(&original, NodeFlag::Decommissioned, true);
    // Balancer only: the extra peer is placed but never reports.
    cluster.now += STEP_MS;
    cluster
        .balancer
        .tick(&mut cluster.store, &mut cluster.registry, cluster.now)
        .unwrap();
    assert_eq!(cluster.store.cell(cell).unwrap().peers.len(), 2);

    cluster
        .registry
        .set_flag(&original, NodeFlag::Decommissioned, false);
    cluster.step();

    assert_eq!(cluster.addresses(cell), vec![original.clone()]);
    assert!(cluster.store.cell(cell).unwrap().moves.is_empty());
    assert!(cluster.saw(|k| matches!(k, BalancerEventKind::MoveAborted { source: 0 })));
    assert!(cluster.converge(5).is_some());
    assert_eq!(cluster.leader_address(cell), Some(original));
}

#[test]
fn stuck_extra_peer_times_out_and_revokes_source() {
    let config = TabletManagerConfig {
        decommission_through_extra_peers: true,
        decommissioned_leader_reassignment_timeout_ms: 1_000,
        ..Default::default()
    };
    let mut cluster = Cluster::new(config, &["n1"]);
    let cell = cluster.bundle("b", 1, 1)[0];
    assert!(cluster.converge(5).is_some());

    cluster.registry.set_flag("n1", NodeFlag::Decommissioned, true);
    cluster.run(5);
    assert_eq!(cluster.store.cell(cell).unwrap().peers.len(), 2);
    assert_eq!(cluster.addresses(cell), vec!["n1".to_string()]);

    cluster.run(10);
    assert!(cluster.saw(|k| matches!(
        k,
        BalancerEventKind::PeerRevoked { reason, .. } if reason == "leader reassignment timed out"
    )));
    let cell = cluster.store.cell(cell).unwrap();
    assert_eq!(cell.peers.len(), 1);
    assert!(!cell.peers[0].is_assigned());
}

#[test]
fn banned_nodes_are_drained_and_cells_recover() {
    let mut cluster = Cluster::new(TabletManagerConfig::default(), &["n1", "n2", "n3", "n4", "n5"]);
    let cells = cluster.bundle("b", 3, 4);
    assert!(cluster.converge(10).is_some());

    cluster.registry.set_flag("n1", NodeFlag::Banned, true);
    cluster.registry.set_flag("n2", NodeFlag::Banned, true);
    assert!(cluster.converge(20).is_some());

    for cell in &cells {
        let addresses = cluster.addresses(*cell);
        assert_eq!(addresses.len(), 3);
        assert!(addresses.iter().all(|a| a != "n1" && a != "n2"));
    }
    let counts = cluster.peers_per_node();
    assert_eq!(counts.values().copied().collect::<Vec<_>>(), vec![4, 4, 4]);
}

#[test]
fn tag_filter_change_moves_peers() {
    let mut cluster = Cluster::new(TabletManagerConfig::default(), &[]);
    for (address, tag) in [("n1", "ssd"), ("n2", "ssd"), ("n3", "hdd")] {
        cluster
            .registry
            .upsert_node(address, tags(&[tag]), ResourceVector::cpu(8.0), 0)
            .unwrap();
    }
    let cell = cluster.bundle("b", 2, 1)[0];
    cluster
        .store
        .set_bundle_node_tag_filter(ROOT_USER, "b", "ssd")
        .unwrap();
    assert!(cluster.converge(5).is_some());
    let mut addresses = cluster.addresses(cell);
    addresses.sort();
    assert_eq!(addresses, vec!["n1".to_string(), "n2".to_string()]);

    // n2 loses its tag: its peer goes and nothing can replace it yet.
    cluster
        .registry
        .upsert_node("n2", tags(&["hdd"]), ResourceVector::cpu(8.0), cluster.now)
        .unwrap();
    cluster.run(3);
    assert_eq!(cluster.addresses(cell), vec!["n1".to_string()]);
    assert_ne!(cluster.health(cell), CellHealth::Good);

    cluster
        .registry
        .upsert_node("n4", tags(&["ssd"]), ResourceVector::cpu(8.0), cluster.now)
        .unwrap();
    assert!(cluster.converge(5).is_some());
    let mut addresses = cluster.addresses(cell);
    addresses.sort();
    assert_eq!(addresses, vec!["n1".to_string(), "n4".to_string()]);
}

#[test]
fn lost_leader_is_replaced_after_reassignment_timeout() {
    let config = TabletManagerConfig {
        leader_reassignment_timeout_ms: 1_000,
        peer_revocation_timeout_ms: 5_000,
        ..Default::default()
    };
    let mut cluster = Cluster::new(config, &["n1", "n2"]);
    let cell = cluster.bundle("b", 1, 1)[0];
    assert!(cluster.converge(5).is_some());
    let original = cluster.leader_address(cell).unwrap();

    cluster.registry.remove_node(&original);
    cluster.run(5);
    assert_eq!(cluster.addresses(cell), vec![original.clone()]);
    assert_eq!(cluster.leader_address(cell), None);

    assert!(cluster.converge(20).is_some());
    let replacement = cluster.leader_address(cell).unwrap();
    assert_ne!(replacement, original);
    assert!(cluster.saw(|k| matches!(
        k,
        BalancerEventKind::PeerRevoked { reason, .. } if reason == "peer lost"
    )));
}

#[test]
fn prerequisite_abort_reelects_and_writes_resume() {
    let mut cluster = Cluster::new(TabletManagerConfig::default(), &["n1", "n2", "n3"]);
    let cell = cluster.bundle("b", 3, 1)[0];
    assert!(cluster.converge(5).is_some());
    cluster
        .store
        .create_table(ROOT_USER, "//t", "b", "tmp", vec![], false, cluster.now)
        .unwrap();
    cluster.store.mount_table("//t", None, false, cluster.now).unwrap();
    cluster.step();
    cluster.store.insert_rows("//t", rows(4), cluster.now).unwrap();

    let version = cluster.store.cell(cell).unwrap().config_version;
    cluster.store.abort_prerequisite_transaction(cell).unwrap();
    assert!(cluster.store.cell(cell).unwrap().config_version > version);
    assert!(cluster.store.insert_rows("//t", rows(1), cluster.now).is_err());

    assert!(cluster.converge(5).is_some());
    cluster
        .store
        .insert_rows("//t", vec![("k9".to_string(), json!({ "v": 9 }))], cluster.now)
        .unwrap();
    assert_eq!(cluster.store.select_all("//t").unwrap().len(), 5);
}

#[test]
fn decommissioner_honors_suppression_then_removes_cell() {
    let mut cluster = Cluster::new(TabletManagerConfig::default(), &["n1"]);
    let cell = cluster.bundle("b", 1, 1)[0];
    assert!(cluster.converge(5).is_some());

    let suppress = DynamicBundleOptions {
        suppress_tablet_cell_decommission: true,
        ..Default::default()
    };
    cluster
        .store
        .set_bundle_dynamic_options(ROOT_USER, "b", suppress)
        .unwrap();
    cluster.store.remove_cell(cell, false, cluster.now).unwrap();
    cluster.run(30);
    let held = cluster.store.cell(cell).unwrap();
    assert_eq!(held.life_stage, LifeStage::DecommissioningOnNode);
    assert!(held.peers.iter().all(|p| p.state == tessera_core::PeerState::Stopped));

    cluster
        .store
        .set_bundle_dynamic_options(ROOT_USER, "b", DynamicBundleOptions::default())
        .unwrap();
    cluster.run(30);
    assert!(cluster.store.cell(cell).is_none());
    assert!(cluster.saw(|k| *k == BalancerEventKind::CellDecommissioned));
    assert!(cluster.saw(|k| *k == BalancerEventKind::CellRemoved));
    assert!(cluster.registry.get("n1").unwrap().tablet_slots.is_empty());
}

#[test]
fn new_node_receives_peers_on_rebalance() {
    let mut config = TabletManagerConfig::default();
    config.tablet_cell_balancer.rebalance_wait_time_ms = 500;
    let mut cluster = Cluster::new(config, &["n1", "n2", "n3"]);
    cluster.bundle("b", 1, 6);
    assert!(cluster.converge(5).is_some());
    assert!(cluster.peers_per_node().values().all(|&n| n == 2));

    cluster
        .registry
        .upsert_node("n4", tags(&[]), ResourceVector::cpu(8.0), cluster.now)
        .unwrap();
    cluster.run(30);
    assert!(cluster.converge(5).is_some());

    let counts = cluster.peers_per_node();
    let max = counts.values().max().copied().unwrap();
    let min = counts.values().min().copied().unwrap();
    assert!(max - min <= 1, "unbalanced: {counts:?}");
    assert!(counts["n4"] >= 1);
}

#[derive(Debug, Clone, Copy)]
enum NodeOp {
    Ban,
    Decommission,
    DisableCells,
    Restore,
}

fn node_op() -> impl Strategy<Value = (usize, NodeOp)> {
    let op = prop_oneof![
        Just(NodeOp::Ban),
        Just(NodeOp::Decommission),
        Just(NodeOp::DisableCells),
        Just(NodeOp::Restore),
    ];
    (0usize..6, op)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn converges_after_any_flag_sequence(
        ops in proptest::collection::vec(node_op(), 1..12),
        through_extra in any::<bool>(),
    ) {
        let config = TabletManagerConfig {
            decommission_through_extra_peers: through_extra,
            extra_peer_drop_delay_ms: 200,
            ..Default::default()
        };
        let nodes = ["n0", "n1", "n2", "n3", "n4", "n5"];
        let mut cluster = Cluster::new(config, &nodes);
        cluster.bundle("b", 2, 3);
        cluster.run(3);

        for (node, op) in ops {
            let address = nodes[node];
            match op {
                NodeOp::Ban => { cluster.registry.set_flag(address, NodeFlag::Banned, true); }
                NodeOp::Decommission => { cluster.registry.set_flag(address, NodeFlag::Decommissioned, true); }
                NodeOp::DisableCells => { cluster.registry.set_flag(address, NodeFlag::DisableTabletCells, true); }
                NodeOp::Restore => {
                    for flag in [NodeFlag::Banned, NodeFlag::Decommissioned, NodeFlag::DisableTabletCells] {
                        cluster.registry.set_flag(address, flag, false);
                    }
                }
            }
            cluster.step();
        }
        // Leave enough eligible nodes behind.
        for address in &nodes[..2] {
            for flag in [NodeFlag::Banned, NodeFlag::Decommissioned, NodeFlag::DisableTabletCells] {
                cluster.registry.set_flag(address, flag, false);
            }
        }

        prop_assert!(cluster.converge(100).is_some());
        for cell in cluster.store.cells() {
            prop_assert_eq!(cell.peers.len(), 2);
            for (_, address) in cell.peer_addresses() {
                prop_assert!(cluster.registry.get(address).unwrap().accepts_tablet_cells());
            }
        }
    }
}

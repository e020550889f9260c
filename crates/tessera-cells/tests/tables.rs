//! Table lifecycle and data plane tests against a store with hand-placed
//! peers.

use serde_json::json;
use tessera_cells::*;
use tessera_core::{Acl, CellId, ErrorKind, PeerState, ROOT_USER};

fn store_with_cell() -> (CellStore, CellId) {
    let mut store = CellStore::in_memory().unwrap().with_snapshot_threshold(4);
    store
        .create_bundle(ROOT_USER, "default", BundleOptions::default(), Acl::default(), 0)
        .unwrap();
    let cell = store.create_cell(ROOT_USER, "default", 0).unwrap();
    bring_up(&mut store, cell, "node-1:9012");
    (store, cell)
}

/// Place every unassigned peer on `address` and elect a leader.
fn bring_up(store: &mut CellStore, cell: CellId, address: &str) {
    let free: Vec<usize> = store
        .cell(cell)
        .unwrap()
        .peers
        .iter()
        .enumerate()
        .filter(|(_, p)| !p.is_assigned())
        .map(|(i, _)| i)
        .collect();
    for peer in free {
        store.assign_peer(cell, peer, address, 0).unwrap();
    }
    let version = store.cell(cell).unwrap().config_version;
    let peers: Vec<(usize, String)> = store
        .cell(cell)
        .unwrap()
        .peer_addresses()
        .map(|(i, a)| (i, a.to_string()))
        .collect();
    for (peer, addr) in peers {
        store
            .report_peer_state(cell, peer, &addr, PeerState::Following, version)
            .unwrap();
    }
    store.elect_leader(cell).unwrap();
}

fn rows(n: usize) -> Vec<(String, serde_json::Value)> {
    (0..n).map(|i| (format!("k{i}"), json!({ "value": i }))).collect()
}

#[test]
fn mount_write_unmount_remount_keeps_rows() {
    let (mut store, _) = store_with_cell();
    store
        .create_table(ROOT_USER, "//tmp/t", "default", "tmp", vec![], false, 0)
        .unwrap();
    store.mount_table("//tmp/t", None, false, 1).unwrap();
    assert_eq!(store.table_state("//tmp/t").unwrap(), TableTabletState::Transient);
    store.tick(2).unwrap();
    assert_eq!(store.table_state("//tmp/t").unwrap(), TableTabletState::Mounted);

    store.insert_rows("//tmp/t", rows(5), 3).unwrap();
    assert_eq!(store.select_all("//tmp/t").unwrap().len(), 5);

    store.unmount_table("//tmp/t", 4).unwrap();
    let err = store.insert_rows("//tmp/t", rows(1), 4).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TabletNotMounted);
    store.tick(5).unwrap();
    assert_eq!(store.table_state("//tmp/t").unwrap(), TableTabletState::Unmounted);
    assert_eq!(store.table("//tmp/t").unwrap().stored_rows.len(), 5);

    store.mount_table("//tmp/t", None, false, 6).unwrap();
    store.tick(7).unwrap();
    let found = store
        .lookup_rows("//tmp/t", &["k3".to_string(), "missing".to_string()])
        .unwrap();
    assert_eq!(found[0], Some(json!({ "value": 3 })));
    assert_eq!(found[1], None);
}

#[test]
fn transition_errors_follow_table() {
    let (mut store, _) = store_with_cell();
    store
        .create_table(ROOT_USER, "//tmp/t", "default", "tmp", vec![], false, 0)
        .unwrap();
    let err = store.freeze_table("//tmp/t", 1).unwrap_err();
    assert!(matches!(err, CellError::InvalidTransition { .. }));

    store.mount_table("//tmp/t", None, true, 1).unwrap();
    store.tick(2).unwrap();
    assert_eq!(store.table_state("//tmp/t").unwrap(), TableTabletState::Frozen);
    assert!(store.mount_table("//tmp/t", None, false, 3).is_err());

    let err = store.insert_rows("//tmp/t", rows(1), 3).unwrap_err();
    assert!(matches!(err, CellError::TabletFrozen { .. }));
    assert!(store.select_all("//tmp/t").unwrap().is_empty());

    store.unfreeze_table("//tmp/t", 4).unwrap();
    store.tick(5).unwrap();
    store.insert_rows("//tmp/t", rows(2), 6).unwrap();
    assert_eq!(store.remount_table("//tmp/t").unwrap(), 1);
}

#[test]
fn safe_mode_blocks_writes_not_reads() {
    let (mut store, _) = store_with_cell();
    store
        .create_table(ROOT_USER, "//tmp/t", "default", "tmp", vec![], false, 0)
        .unwrap();
    store.mount_table("//tmp/t", None, false, 0).unwrap();
    store.tick(1).unwrap();
    store.insert_rows("//tmp/t", rows(2), 1).unwrap();

    store.set_safe_mode(true);
    let err = store.insert_rows("//tmp/t", rows(1), 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SafeMode);
    assert!(store.delete_rows("//tmp/t", vec!["k0".into()], 2).is_err());
    assert_eq!(store.select_all("//tmp/t").unwrap().len(), 2);

    store.set_safe_mode(false);
    store.delete_rows("//tmp/t", vec!["k0".into()], 3).unwrap();
    assert_eq!(store.select_all("//tmp/t").unwrap().len(), 1);
}

#[test]
fn rows_survive_prerequisite_abort_and_reelection() {
    let (mut store, cell) = store_with_cell();
    store
        .create_table(ROOT_USER, "//tmp/t", "default", "tmp", vec![], false, 0)
        .unwrap();
    store.mount_table("//tmp/t", None, false, 0).unwrap();
    store.tick(1).unwrap();
    // Enough writes to cross the snapshot threshold.
    store.insert_rows("//tmp/t", rows(3), 1).unwrap();
    store.insert_rows("//tmp/t", vec![("k9".into(), json!(9))], 2).unwrap();
    assert!(store.cell(cell).unwrap().max_snapshot_id >= 1);

    let v0 = store.cell(cell).unwrap().config_version;
    store.abort_prerequisite_transaction(cell).unwrap();
    assert!(store.cell(cell).unwrap().config_version > v0);
    assert_eq!(store.insert_rows("//tmp/t", rows(1), 3).unwrap_err().kind(), ErrorKind::InvalidState);

    bring_up(&mut store, cell, "node-2:9012");
    assert_eq!(store.select_all("//tmp/t").unwrap().len(), 4);
    store.insert_rows("//tmp/t", vec![("k10".into(), json!(10))], 4).unwrap();
    assert_eq!(store.select_all("//tmp/t").unwrap().len(), 5);
}

#[test]
fn account_limits_and_transfer() {
    let (mut store, _) = store_with_cell();
    store.accounts_mut().create(
        "small",
        AccountLimits {
            tablet_count: Some(2),
            ..Default::default()
        },
    );
    let err = store
        .create_table(
            ROOT_USER,
            "//tmp/big",
            "default",
            "small",
            vec!["".into(), "b".into(), "c".into()],
            false,
            0,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceLimitExceeded);

    store
        .create_table(ROOT_USER, "//tmp/t", "default", "tmp", vec!["".into(), "m".into()], false, 0)
        .unwrap();
    store.set_table_account("//tmp/t", "small").unwrap();
    assert_eq!(store.accounts().get("small").unwrap().usage.tablet_count, 2);
    assert_eq!(store.accounts().get("tmp").unwrap().usage.tablet_count, 0);

    assert_eq!(
        store.reshard_table("//tmp/t", vec!["".into(), "f".into(), "m".into()]).unwrap_err().kind(),
        ErrorKind::ResourceLimitExceeded
    );
    store.reshard_table("//tmp/t", vec!["".into()]).unwrap();
    assert_eq!(store.accounts().get("small").unwrap().usage.tablet_count, 1);
}

#[test]
fn in_memory_tables_charge_bundle_static_memory() {
    let (mut store, _) = store_with_cell();
    store
        .create_table(ROOT_USER, "//tmp/mem", "default", "tmp", vec![], true, 0)
        .unwrap();
    store.mount_table("//tmp/mem", None, false, 0).unwrap();
    store.tick(1).unwrap();
    store.insert_rows("//tmp/mem", rows(3), 1).unwrap();
    store.unmount_table("//tmp/mem", 2).unwrap();
    store.tick(3).unwrap();

    store
        .set_bundle_resource_limits(
            ROOT_USER,
            "default",
            AccountLimits {
                tablet_static_memory: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
    let err = store.mount_table("//tmp/mem", None, false, 4).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceLimitExceeded);

    store
        .set_bundle_resource_limits(ROOT_USER, "default", AccountLimits::default())
        .unwrap();
    store.mount_table("//tmp/mem", None, false, 5).unwrap();
    let charged = store.bundle_by_name("default").unwrap().resource_usage.tablet_static_memory;
    assert!(charged > 0);
    assert_eq!(store.accounts().get("tmp").unwrap().usage.tablet_static_memory, charged);
}

#[test]
fn decommissioning_cell_rejects_writes() {
    let (mut store, cell) = store_with_cell();
    store
        .create_table(ROOT_USER, "//tmp/t", "default", "tmp", vec![], false, 0)
        .unwrap();
    store.mount_table("//tmp/t", None, false, 0).unwrap();
    store.tick(1).unwrap();
    store.remove_cell(cell, false, 2).unwrap();
    assert_eq!(store.cell(cell).unwrap().life_stage, LifeStage::DecommissioningOnNode);
    let err = store.insert_rows("//tmp/t", rows(1), 2).unwrap_err();
    assert!(matches!(err, CellError::CellNotWritable { .. }));
    assert!(matches!(
        store.mount_table("//tmp/other", None, false, 2).unwrap_err(),
        CellError::NoSuchTable(_)
    ));
}

#[test]
fn move_action_relocates_tablets() {
    let (mut store, first) = store_with_cell();
    let second = store.create_cell(ROOT_USER, "default", 0).unwrap();
    bring_up(&mut store, second, "node-2:9012");
    store
        .create_table(ROOT_USER, "//tmp/t", "default", "tmp", vec![], false, 0)
        .unwrap();
    store.mount_table("//tmp/t", Some(first), false, 0).unwrap();
    store.tick(1).unwrap();
    store.insert_rows("//tmp/t", rows(5), 1).unwrap();

    let id = store
        .create_tablet_action(
            NewTabletAction {
                kind: TabletActionKind::Move { cells: vec![second] },
                table: "//tmp/t".into(),
                tablets: vec![0],
                keep_finished: true,
                expiration_time: None,
                skip_freezing: false,
            },
            2,
        )
        .unwrap();
    for now in 3..12 {
        store.tick(now).unwrap();
    }
    let action = store.tablet_action(id).unwrap();
    assert_eq!(action.state, TabletActionState::Completed, "{:?}", action.error);
    assert_eq!(store.table("//tmp/t").unwrap().tablets[0].cell_id, Some(second));
    assert_eq!(store.table_state("//tmp/t").unwrap(), TableTabletState::Mounted);
    assert_eq!(store.select_all("//tmp/t").unwrap().len(), 5);

    store.tick(100).unwrap();
    assert!(store.tablet_action(id).is_some());
}

#[test]
fn reshard_action_without_keep_finished_disappears() {
    let (mut store, _) = store_with_cell();
    store
        .create_table(ROOT_USER, "//tmp/t", "default", "tmp", vec![], false, 0)
        .unwrap();
    store.mount_table("//tmp/t", None, false, 0).unwrap();
    store.tick(1).unwrap();
    store.insert_rows("//tmp/t", rows(6), 1).unwrap();

    let id = store
        .create_tablet_action(
            NewTabletAction {
                kind: TabletActionKind::Reshard {
                    pivot_keys: vec!["".into(), "k3".into()],
                },
                table: "//tmp/t".into(),
                tablets: vec![0],
                keep_finished: false,
                expiration_time: None,
                skip_freezing: true,
            },
            2,
        )
        .unwrap();
    for now in 3..12 {
        store.tick(now).unwrap();
    }
    assert!(store.tablet_action(id).is_none());
    let table = store.table("//tmp/t").unwrap();
    assert_eq!(table.tablets.len(), 2);
    assert_eq!(store.table_state("//tmp/t").unwrap(), TableTabletState::Mounted);
    assert_eq!(store.select_all("//tmp/t").unwrap().len(), 6);
}

#[test]
fn expired_actions_are_dropped() {
    let (mut store, _) = store_with_cell();
    store
        .create_table(ROOT_USER, "//tmp/t", "default", "tmp", vec![], false, 0)
        .unwrap();
    let id = store
        .create_tablet_action(
            NewTabletAction {
                kind: TabletActionKind::Move { cells: vec![] },
                table: "//tmp/t".into(),
                tablets: vec![0],
                keep_finished: true,
                expiration_time: Some(5),
                skip_freezing: false,
            },
            0,
        )
        .unwrap();
    store.tick(1).unwrap();
    // Unmounted tablets cannot be moved.
    assert_eq!(store.tablet_action(id).unwrap().state, TabletActionState::Failed);
    store.tick(5).unwrap();
    assert!(store.tablet_action(id).is_none());
}

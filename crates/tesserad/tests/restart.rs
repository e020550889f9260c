//! The controller persists fair-share snapshots and restores them on the
//! next start over the same data directory.

use tempfile::tempdir;

use tessera_core::{now_ms, TesseraConfig, UserDirectory};
use tessera_state::StateStore;
use tesserad::Controller;

#[tokio::test]
async fn fair_share_snapshot_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("tessera.redb");

    {
        let state = StateStore::open(&db_path).unwrap();
        let controller = Controller::new(TesseraConfig::default(), state, UserDirectory::default()).unwrap();
        controller.fair_share_pass(now_ms()).await;
        controller.shutdown().await;
    }

    let state = StateStore::open(&db_path).unwrap();
    let snapshot = state.get_fair_share_snapshot("default").unwrap();
    assert!(snapshot.is_some());

    let controller = Controller::new(TesseraConfig::default(), state, UserDirectory::default()).unwrap();
    controller.fair_share_pass(now_ms()).await;
    let orchid = controller.orchid().read().await;
    assert!(orchid.resolve("/scheduler/pool_trees/default").is_ok());
}

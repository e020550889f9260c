use std::collections::BTreeSet;

use serde_json::{json, Value};
use tempfile::tempdir;

use tessera_cells::{BundleOptions, CellStore};
use tessera_core::{Acl, ErrorKind, EventLogConfig, Millis, OperationId, OperationKind, ResourceVector, TesseraConfig, UserDirectory, ROOT_USER};
use tessera_nodes::NodeRegistry;
use tessera_orchid::{EventLogWriter, EventRecord, MemoryEventSink, OrchidTree};
use tessera_pools::PoolConfig;
use tessera_scheduler::{HeartbeatRequest, Scheduler};

struct World {
    scheduler: Scheduler,
    nodes: NodeRegistry,
    cells: CellStore,
}

impl World {
    fn new() -> Self {
        let mut users = UserDirectory::default();
        users.add_user("alice");
        let mut scheduler = Scheduler::new(TesseraConfig::default(), users);
        scheduler
            .create_pool("default", "research", None, PoolConfig::default(), 0)
            .unwrap();
        let mut nodes = NodeRegistry::new();
        nodes
            .upsert_node("n1", BTreeSet::new(), ResourceVector::cpu(8.0), 0)
            .unwrap();
        Self {
            scheduler,
            nodes,
            cells: CellStore::in_memory().unwrap(),
        }
    }

    fn submit(&mut self, spec: Value, now: Millis) -> OperationId {
        self.scheduler
            .start_operation("alice", OperationKind::Vanilla, &spec, now)
            .unwrap()
    }

    fn tick(&mut self, now: Millis) {
        self.scheduler.fair_share_tick(&mut self.nodes, now);
    }

    fn heartbeat(&mut self, now: Millis) {
        self.scheduler
            .process_heartbeat(&mut self.nodes, &HeartbeatRequest::new("n1"), true, now)
            .unwrap();
    }

    fn orchid(&self, now: Millis) -> OrchidTree {
        OrchidTree::build(&self.scheduler, &self.nodes, &self.cells, now).unwrap()
    }
}

#[test]
fn orchid_exposes_pools_operations_nodes_and_cells() {
    let mut w = World::new();
    w.cells
        .create_bundle(ROOT_USER, "default", BundleOptions::default(), Acl::default(), 0)
        .unwrap();
    let cell = w.cells.create_cell(ROOT_USER, "default", 0).unwrap();
    let op = w.submit(json!({"pool": "research", "job_count": 2}), 0);
    w.tick(1_000);

    let orchid = w.orchid(1_000);
    assert_eq!(orchid.built_at(), 1_000);

    let pool = orchid
        .resolve("/scheduler/pool_trees/default/pools/research")
        .unwrap();
    assert_eq!(pool["name"], json!("research"));
    assert_eq!(pool["is_ephemeral"], json!(false));
    assert!(pool.get("fair_share").is_some());

    let placed = orchid
        .resolve(&format!("/scheduler/pool_trees/default/operations/{op}"))
        .unwrap();
    assert_eq!(placed["pool"], json!("research"));
    assert!(placed.get("satisfaction_ratio").is_some());

    let operation = orchid
        .resolve(&format!("/scheduler/operations/{op}"))
        .unwrap();
    assert_eq!(operation["state"], json!("running"));
    assert_eq!(operation["pending_job_count"], json!(2));

    assert!(orchid.resolve("/scheduler/nodes/n1/resource_limits").is_ok());
    assert_eq!(orchid.resolve("/scheduler/alerts").unwrap(), &json!([]));
    assert_eq!(
        orchid.resolve(&format!("/tablet_cells/{cell}/bundle")).unwrap(),
        &json!("default")
    );
    assert_eq!(
        orchid.resolve("/tablet_cell_bundles/default/name").unwrap(),
        &json!("default")
    );
    assert_eq!(orchid.list("/scheduler/pool_trees").unwrap(), vec!["default"]);
}

#[test]
fn missing_orchid_path_is_a_resolve_error() {
    let w = World::new();
    let orchid = w.orchid(0);
    let err = orchid
        .resolve("/scheduler/pool_trees/default/pools/nope")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolve);
    assert!(orchid.resolve("/tablet_cells/x").is_err());
    assert!(orchid.resolve("/").unwrap().get("scheduler").is_some());
}

#[test]
fn fair_share_info_is_split_into_batches_sharing_the_snapshot_id() {
    let mut w = World::new();
    for _ in 0..3 {
        w.submit(json!({"pool": "research"}), 0);
    }
    w.tick(1_000);

    let sink = MemoryEventSink::new(1_000);
    let mut writer = EventLogWriter::new(
        EventLogConfig {
            max_event_log_operation_batch_size: 2,
            ..EventLogConfig::default()
        },
        sink.clone(),
    );
    let shares = w.scheduler.shares("default").unwrap().clone();
    assert!(writer.log_fair_share(&shares, 1_000));
    writer.flush(1_000).unwrap();

    let records = sink.of_type("fair_share_info");
    assert!(
        records
            .iter()
            .all(|r| r.get("tree_snapshot_id") == Some(&json!(shares.snapshot_id)))
    );
    assert_eq!(records[0].get("pool_count"), Some(&json!(shares.pools.len())));

    let batches: Vec<&EventRecord> = records
        .iter()
        .filter(|r| r.get("operations_batch_index").is_some())
        .collect();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].get("operations_batch_index"), Some(&json!(0)));
    assert_eq!(batches[1].get("operations_batch_index"), Some(&json!(1)));
    let logged: usize = batches
        .iter()
        .map(|r| r.get("operations").and_then(Value::as_object).map_or(0, |m| m.len()))
        .sum();
    assert_eq!(logged, 3);
    assert_eq!(sink.of_type("pools_info").len(), 1);
}

#[test]
fn accumulated_usage_is_followed_by_metering_records() {
    let mut w = World::new();
    w.submit(json!({"pool": "research", "job_count": 2, "job_resources": {"cpu": 2.0}}), 0);
    w.tick(1_000);
    w.heartbeat(1_000);
    w.tick(2_000);

    let sink = MemoryEventSink::new(1_000);
    let mut writer = EventLogWriter::new(EventLogConfig::default(), sink.clone());

    assert!(writer.accumulated_usage_due("default", 2_000));
    let usage = w.scheduler.drain_accumulated_usage("default");
    writer.log_accumulated_usage(w.scheduler.tree("default").unwrap(), &usage, 2_000);
    assert!(!writer.accumulated_usage_due("default", 3_000));

    w.tick(3_000);
    let usage = w.scheduler.drain_accumulated_usage("default");
    writer.log_accumulated_usage(w.scheduler.tree("default").unwrap(), &usage, 3_000);
    writer.flush(3_000).unwrap();

    let accumulated = sink.of_type("accumulated_usage_info");
    assert_eq!(accumulated.len(), 2);
    assert!(accumulated[1].get("pools").unwrap().get("research").is_some());

    let metering = sink.of_type("metering");
    let research = metering
        .iter()
        .find(|r| r.get("tags").and_then(|t| t.get("pool")) == Some(&json!("research")))
        .expect("metering record for research");
    assert_eq!(research.get("usage").unwrap()["quantity"], json!(1_000));
    assert_eq!(research.get("tags").unwrap()["pool_tree"], json!("default"));
}

#[test]
fn scheduler_events_reach_the_log_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("scheduler/event_log.jsonl");
    let mut writer = EventLogWriter::open(EventLogConfig {
        path: Some(path.clone()),
        ..EventLogConfig::default()
    })
    .unwrap();

    let mut w = World::new();
    let op = w.submit(json!({"pool": "research"}), 0);
    w.heartbeat(10);
    writer.log_scheduler_events(&w.scheduler.drain_events());
    assert!(writer.flush(10).unwrap() >= 3);
    assert_eq!(writer.buffered(), 0);

    let lines: Vec<Value> = std::fs::read_to_string(&path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let started = lines
        .iter()
        .find(|l| l["event_type"] == json!("operation_started"))
        .unwrap();
    assert_eq!(started["operation_id"], json!(op.to_string()));
    assert_eq!(started["pools"]["default"], json!("research"));
    assert!(lines.iter().any(|l| l["event_type"] == json!("job_started")));
}

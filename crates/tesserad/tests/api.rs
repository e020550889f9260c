//! HTTP regression tests: every request goes through the router with
//! `oneshot`, while the periodic passes are driven by hand.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use tessera_core::{now_ms, TesseraConfig, UserDirectory};
use tesserad::{build_router, Controller};

fn controller() -> Controller {
    let mut users = UserDirectory::default();
    users.add_user("alice");
    Controller::in_memory(TesseraConfig::default(), users).unwrap()
}

async fn call(controller: &Controller, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = build_router(controller.clone()).oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn get(controller: &Controller, uri: &str) -> (StatusCode, Value) {
    call(controller, Method::GET, uri, None).await
}

async fn post(controller: &Controller, uri: &str, body: Value) -> (StatusCode, Value) {
    call(controller, Method::POST, uri, Some(body)).await
}

async fn put(controller: &Controller, uri: &str, body: Value) -> (StatusCode, Value) {
    call(controller, Method::PUT, uri, Some(body)).await
}

async fn register_node(controller: &Controller, address: &str, cpu: f64) {
    let (status, _) = put(
        controller,
        &format!("/api/v1/nodes/{address}"),
        json!({ "resource_limits": { "cpu": cpu } }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

/// Run balancer passes until every cell reports good health.
async fn converge_cells(controller: &Controller) -> u64 {
    let mut now = now_ms();
    for _ in 0..20 {
        now += 100;
        controller.balancer_pass(now).await;
        let cells = controller.cells().read().await;
        let good = cells.cell_ids().into_iter().all(|id| {
            cells
                .cell_orchid(id)
                .is_some_and(|c| c["health"] == json!("good"))
        });
        if good {
            return now;
        }
    }
    panic!("cells did not converge");
}

#[tokio::test]
async fn orchid_serves_pool_tree_after_a_pass() {
    let controller = controller();
    let (status, _) = post(
        &controller,
        "/api/v1/pool_trees/default/pools",
        json!({ "name": "research" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    controller.fair_share_pass(now_ms()).await;

    let (status, body) = get(&controller, "/orchid/scheduler/pool_trees/default/pools/research").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["name"], json!("research"));

    let (status, body) = get(&controller, "/orchid").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].get("scheduler").is_some());
}

#[tokio::test]
async fn missing_orchid_path_is_not_found() {
    let controller = controller();
    let (status, body) = get(&controller, "/orchid/scheduler/pool_trees/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["kind"], json!("resolve"));
}

#[tokio::test]
async fn heartbeat_starts_jobs_and_abort_finishes_the_operation() {
    let controller = controller();
    register_node(&controller, "n1", 4.0).await;

    let (status, body) = post(
        &controller,
        "/api/v1/operations",
        json!({
            "user": "alice",
            "spec": { "pool": "batch", "job_count": 2, "job_resources": { "cpu": 1.0 } }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let op = body["data"]["operation_id"].as_str().unwrap().to_string();

    let (status, body) = post(&controller, "/api/v1/nodes/n1/heartbeat", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let started = body["data"]["jobs_to_start"].as_array().unwrap();
    assert_eq!(started.len(), 2);
    assert!(started.iter().all(|j| j["operation_id"] == json!(op)));

    let (status, body) = post(&controller, &format!("/api/v1/operations/{op}/abort"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], json!("aborted"));

    // Aborting twice is a state conflict.
    let (status, _) = post(&controller, &format!("/api/v1/operations/{op}/abort"), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn bad_operation_requests_are_rejected() {
    let controller = controller();
    let (status, body) = post(&controller, "/api/v1/operations/not-a-uuid/abort", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], json!("configuration"));

    let (status, _) = post(
        &controller,
        "/api/v1/operations",
        json!({ "user": "alice", "spec": { "job_count": "many" } }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(&controller, "/api/v1/nodes/ghost/ban", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn suspended_operation_resumes() {
    let controller = controller();
    let (_, body) = post(
        &controller,
        "/api/v1/operations",
        json!({ "user": "alice", "spec": { "job_count": 1 } }),
    )
    .await;
    let op = body["data"]["operation_id"].as_str().unwrap().to_string();

    let (status, body) = post(&controller, &format!("/api/v1/operations/{op}/suspend"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["suspended"], json!(true));

    let (_, body) = post(&controller, &format!("/api/v1/operations/{op}/resume"), json!({})).await;
    assert_eq!(body["data"]["suspended"], json!(false));

    let (status, _) = post(&controller, &format!("/api/v1/operations/{op}/explode"), json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cells_come_up_and_safe_mode_blocks_writes() {
    let controller = controller();
    register_node(&controller, "n1", 8.0).await;

    let (status, _) = post(&controller, "/api/v1/bundles", json!({ "name": "default" })).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = post(&controller, "/api/v1/bundles/default/cells", json!({})).await;
    assert_eq!(status, StatusCode::CREATED);
    let cell = body["data"]["cell_id"].as_str().unwrap().to_string();

    let now = converge_cells(&controller).await;
    let (status, body) = get(&controller, &format!("/orchid/tablet_cells/{cell}/peers/0/address")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!("n1"));

    let (status, _) = post(
        &controller,
        "/api/v1/tables",
        json!({ "path": "//tmp/t", "bundle": "default", "account": "tmp" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = post(&controller, "/api/v1/tables/mount", json!({ "path": "//tmp/t" })).await;
    assert_eq!(status, StatusCode::OK);
    controller.balancer_pass(now + 100).await;

    let rows = json!({ "path": "//tmp/t", "rows": [["k1", { "v": 1 }], ["k2", { "v": 2 }]] });
    let (status, body) = post(&controller, "/api/v1/rows/insert", rows.clone()).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let config = TesseraConfig {
        enable_safe_mode: true,
        ..TesseraConfig::default()
    };
    let (status, _) = put(&controller, "/api/v1/config", serde_json::to_value(&config).unwrap()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post(&controller, "/api/v1/rows/insert", rows).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["kind"], json!("safe_mode"));

    let (status, body) = post(&controller, "/api/v1/rows/select", json!({ "path": "//tmp/t" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_table_command_is_not_found() {
    let controller = controller();
    let (status, _) = post(&controller, "/api/v1/tables/explode", json!({ "path": "//tmp/t" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = post(&controller, "/api/v1/tables/mount", json!({ "path": "//tmp/missing" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

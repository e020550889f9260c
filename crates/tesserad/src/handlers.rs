//! API handlers.
//!
//! Handlers lock what they touch in the controller's order (scheduler,
//! nodes, cells) and return [`ApiResponse`] JSON. Orchid reads never take
//! the subsystem locks; they see the tree as of the last pass.

use std::collections::BTreeSet;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use tessera_cells::{BundleOptions, NewTabletAction, TabletActionKind};
use tessera_core::{now_ms, CellId, ErrorKind, Millis, OperationId, OperationKind, PoolTreeConfig, ResourceVector, TesseraConfig, ROOT_USER};
use tessera_pools::PoolConfig;
use tessera_scheduler::{HeartbeatRequest, TreeParams};

use crate::api::{ApiError, ApiResponse, ApiResult};
use crate::controller::Controller;

fn root_user() -> String {
    ROOT_USER.to_string()
}

fn parse_operation_id(id: &str) -> Result<OperationId, ApiError> {
    OperationId::parse(id).ok_or_else(|| ApiError::bad_request(format!("invalid operation id {id:?}")))
}

// ── Orchid ─────────────────────────────────────────────────────

/// GET /orchid
pub async fn orchid_root(State(controller): State<Controller>) -> ApiResult<Value> {
    let orchid = controller.orchid().read().await;
    Ok(ApiResponse::ok(orchid.root().clone()))
}

/// GET /orchid/{*path}
pub async fn orchid_path(State(controller): State<Controller>, Path(path): Path<String>) -> ApiResult<Value> {
    let orchid = controller.orchid().read().await;
    Ok(ApiResponse::ok(orchid.resolve(&path)?.clone()))
}

// ── Config and users ───────────────────────────────────────────

/// PUT /api/v1/config
pub async fn apply_config(State(controller): State<Controller>, Json(config): Json<TesseraConfig>) -> ApiResult<&'static str> {
    controller.apply_config(config).await;
    Ok(ApiResponse::ok("applied"))
}

#[derive(Deserialize)]
pub struct AddUserRequest {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// POST /api/v1/users
pub async fn add_user(State(controller): State<Controller>, Json(req): Json<AddUserRequest>) -> ApiResult<String> {
    let mut scheduler = controller.scheduler().write().await;
    let mut cells = controller.cells().write().await;
    for users in [scheduler.users_mut(), cells.users_mut()] {
        users.add_user(&req.name);
        for group in &req.groups {
            users.add_group(group);
            users.add_member(group, &req.name);
        }
    }
    info!(user = %req.name, "user registered");
    Ok(ApiResponse::ok(req.name))
}

// ── Nodes ──────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct UpsertNodeRequest {
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub resource_limits: ResourceVector,
}

/// PUT /api/v1/nodes/{address}
pub async fn upsert_node(
    State(controller): State<Controller>,
    Path(address): Path<String>,
    Json(req): Json<UpsertNodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut nodes = controller.nodes().write().await;
    let created = nodes.upsert_node(&address, req.tags, req.resource_limits, now_ms())?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, ApiResponse::ok(json!({ "address": address, "created": created }))))
}

/// POST /api/v1/nodes/{address}/heartbeat
pub async fn node_heartbeat(
    State(controller): State<Controller>,
    Path(address): Path<String>,
    Json(mut req): Json<HeartbeatRequest>,
) -> ApiResult<tessera_scheduler::HeartbeatResponse> {
    req.address = address;
    let response = controller.service().heartbeat(req).await?;
    Ok(ApiResponse::ok(response))
}

/// POST /api/v1/nodes/{address}/ban
pub async fn ban_node(State(controller): State<Controller>, Path(address): Path<String>) -> ApiResult<Value> {
    let aborted = controller.service().ban_node(&address).await?;
    Ok(ApiResponse::ok(json!({ "address": address, "aborted_jobs": aborted })))
}

// ── Pool trees and pools ───────────────────────────────────────

#[derive(Deserialize)]
pub struct CreatePoolTreeRequest {
    pub name: String,
    #[serde(default)]
    pub config: Option<PoolTreeConfig>,
}

/// POST /api/v1/pool_trees
pub async fn create_pool_tree(
    State(controller): State<Controller>,
    Json(req): Json<CreatePoolTreeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    controller
        .scheduler()
        .write()
        .await
        .create_pool_tree(&req.name, req.config.unwrap_or_default())?;
    Ok((StatusCode::CREATED, ApiResponse::ok(req.name)))
}

/// DELETE /api/v1/pool_trees/{tree}
pub async fn remove_pool_tree(State(controller): State<Controller>, Path(tree): Path<String>) -> ApiResult<&'static str> {
    controller.scheduler().write().await.remove_pool_tree(&tree)?;
    Ok(ApiResponse::ok("deleted"))
}

#[derive(Deserialize)]
pub struct CreatePoolRequest {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub config: Option<PoolConfig>,
}

/// POST /api/v1/pool_trees/{tree}/pools
pub async fn create_pool(
    State(controller): State<Controller>,
    Path(tree): Path<String>,
    Json(req): Json<CreatePoolRequest>,
) -> Result<impl IntoResponse, ApiError> {
    controller.scheduler().write().await.create_pool(
        &tree,
        &req.name,
        req.parent.as_deref(),
        req.config.unwrap_or_default(),
        now_ms(),
    )?;
    Ok((StatusCode::CREATED, ApiResponse::ok(req.name)))
}

/// PUT /api/v1/pool_trees/{tree}/pools/{pool}
pub async fn update_pool(
    State(controller): State<Controller>,
    Path((tree, pool)): Path<(String, String)>,
    Json(config): Json<PoolConfig>,
) -> ApiResult<String> {
    controller
        .scheduler()
        .write()
        .await
        .update_pool(&tree, &pool, config)?;
    Ok(ApiResponse::ok(pool))
}

/// DELETE /api/v1/pool_trees/{tree}/pools/{pool}
pub async fn remove_pool(
    State(controller): State<Controller>,
    Path((tree, pool)): Path<(String, String)>,
) -> ApiResult<&'static str> {
    controller
        .scheduler()
        .write()
        .await
        .remove_pool(&tree, &pool, now_ms())?;
    Ok(ApiResponse::ok("deleted"))
}

// ── Operations ─────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct StartOperationRequest {
    pub user: String,
    #[serde(default = "default_kind")]
    pub kind: OperationKind,
    #[serde(default)]
    pub spec: Value,
}

fn default_kind() -> OperationKind {
    OperationKind::Vanilla
}

/// POST /api/v1/operations
pub async fn start_operation(
    State(controller): State<Controller>,
    Json(req): Json<StartOperationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let spec = if req.spec.is_null() { json!({}) } else { req.spec };
    let id = controller
        .scheduler()
        .write()
        .await
        .start_operation(&req.user, req.kind, &spec, now_ms())?;
    Ok((StatusCode::CREATED, ApiResponse::ok(json!({ "operation_id": id }))))
}

/// POST /api/v1/operations/{id}/{action}
pub async fn operation_action(
    State(controller): State<Controller>,
    Path((id, action)): Path<(String, String)>,
) -> ApiResult<Value> {
    let id = parse_operation_id(&id)?;
    let now: Millis = now_ms();
    let mut scheduler = controller.scheduler().write().await;
    match action.as_str() {
        "abort" | "complete" => {
            let mut nodes = controller.nodes().write().await;
            if action == "abort" {
                scheduler.abort_operation(&mut nodes, id, now)?;
            } else {
                scheduler.complete_operation(&mut nodes, id, now)?;
            }
        }
        "suspend" => scheduler.suspend_operation(id)?,
        "resume" => scheduler.resume_operation(id, now)?,
        other => {
            return Err(ApiError::new(
                ErrorKind::NotFound,
                format!("unknown operation action {other:?}"),
            ));
        }
    }
    let op = scheduler.operation(id)?;
    Ok(ApiResponse::ok(json!({
        "operation_id": id,
        "state": op.state,
        "suspended": op.suspended,
    })))
}

#[derive(Deserialize)]
pub struct UpdateParametersRequest {
    pub tree: String,
    #[serde(flatten)]
    pub params: TreeParams,
}

/// POST /api/v1/operations/{id}/parameters
pub async fn update_operation_parameters(
    State(controller): State<Controller>,
    Path(id): Path<String>,
    Json(req): Json<UpdateParametersRequest>,
) -> ApiResult<Value> {
    let id = parse_operation_id(&id)?;
    let mut scheduler = controller.scheduler().write().await;
    scheduler.update_operation_parameters(id, &req.tree, req.params, now_ms())?;
    let op = scheduler.operation(id)?;
    Ok(ApiResponse::ok(json!({ "operation_id": id, "pools": op.pools })))
}

// ── Bundles, cells and tables ──────────────────────────────────

#[derive(Deserialize)]
pub struct CreateBundleRequest {
    #[serde(default = "root_user")]
    pub user: String,
    pub name: String,
    #[serde(default)]
    pub options: Option<BundleOptions>,
}

/// POST /api/v1/bundles
pub async fn create_bundle(
    State(controller): State<Controller>,
    Json(req): Json<CreateBundleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = controller.cells().write().await.create_bundle(
        &req.user,
        &req.name,
        req.options.unwrap_or_default(),
        Default::default(),
        now_ms(),
    )?;
    Ok((StatusCode::CREATED, ApiResponse::ok(json!({ "id": id, "name": req.name }))))
}

#[derive(Deserialize)]
pub struct UserRequest {
    #[serde(default = "root_user")]
    pub user: String,
}

/// POST /api/v1/bundles/{name}/cells
pub async fn create_cell(
    State(controller): State<Controller>,
    Path(bundle): Path<String>,
    Json(req): Json<UserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = controller
        .cells()
        .write()
        .await
        .create_cell(&req.user, &bundle, now_ms())?;
    Ok((StatusCode::CREATED, ApiResponse::ok(json!({ "cell_id": id }))))
}

#[derive(Deserialize)]
pub struct CreateTableRequest {
    #[serde(default = "root_user")]
    pub user: String,
    pub path: String,
    pub bundle: String,
    pub account: String,
    #[serde(default)]
    pub pivot_keys: Vec<String>,
    #[serde(default)]
    pub in_memory: bool,
}

/// POST /api/v1/tables
pub async fn create_table(
    State(controller): State<Controller>,
    Json(req): Json<CreateTableRequest>,
) -> Result<impl IntoResponse, ApiError> {
    controller.cells().write().await.create_table(
        &req.user,
        &req.path,
        &req.bundle,
        &req.account,
        req.pivot_keys,
        req.in_memory,
        now_ms(),
    )?;
    Ok((StatusCode::CREATED, ApiResponse::ok(req.path)))
}

#[derive(Deserialize)]
pub struct TableCommandRequest {
    pub path: String,
    #[serde(default)]
    pub cell_id: Option<CellId>,
}

/// POST /api/v1/tables/{command}
pub async fn table_command(
    State(controller): State<Controller>,
    Path(command): Path<String>,
    Json(req): Json<TableCommandRequest>,
) -> ApiResult<Value> {
    let now = now_ms();
    let mut cells = controller.cells().write().await;
    match command.as_str() {
        "mount" => cells.mount_table(&req.path, req.cell_id, false, now)?,
        "frozen_mount" => cells.mount_table(&req.path, req.cell_id, true, now)?,
        "unmount" => cells.unmount_table(&req.path, now)?,
        "freeze" => cells.freeze_table(&req.path, now)?,
        "unfreeze" => cells.unfreeze_table(&req.path, now)?,
        "remount" => {
            let remounted = cells.remount_table(&req.path)?;
            return Ok(ApiResponse::ok(json!({ "path": req.path, "remounted": remounted })));
        }
        other => {
            return Err(ApiError::new(ErrorKind::NotFound, format!("unknown table command {other:?}")));
        }
    }
    let state = cells.table_state(&req.path)?;
    Ok(ApiResponse::ok(json!({ "path": req.path, "state": state })))
}

#[derive(Deserialize)]
pub struct CreateTabletActionRequest {
    #[serde(flatten)]
    pub kind: TabletActionKind,
    pub table: String,
    pub tablets: Vec<usize>,
    #[serde(default)]
    pub keep_finished: bool,
    #[serde(default)]
    pub expiration_time: Option<Millis>,
    #[serde(default)]
    pub skip_freezing: bool,
}

/// POST /api/v1/tablet_actions
pub async fn create_tablet_action(
    State(controller): State<Controller>,
    Json(req): Json<CreateTabletActionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request = NewTabletAction {
        kind: req.kind,
        table: req.table,
        tablets: req.tablets,
        keep_finished: req.keep_finished,
        expiration_time: req.expiration_time,
        skip_freezing: req.skip_freezing,
    };
    let id = controller
        .cells()
        .write()
        .await
        .create_tablet_action(request, now_ms())?;
    Ok((StatusCode::CREATED, ApiResponse::ok(json!({ "action_id": id }))))
}

#[derive(Deserialize)]
pub struct RowsRequest {
    pub path: String,
    #[serde(default)]
    pub rows: Vec<(String, Value)>,
    #[serde(default)]
    pub keys: Vec<String>,
}

/// POST /api/v1/rows/{command}
pub async fn rows_command(
    State(controller): State<Controller>,
    Path(command): Path<String>,
    Json(req): Json<RowsRequest>,
) -> ApiResult<Value> {
    let now = now_ms();
    let mut cells = controller.cells().write().await;
    let data = match command.as_str() {
        "insert" => {
            let count = req.rows.len();
            cells.insert_rows(&req.path, req.rows, now)?;
            json!({ "inserted": count })
        }
        "delete" => {
            let count = req.keys.len();
            cells.delete_rows(&req.path, req.keys, now)?;
            json!({ "deleted": count })
        }
        "lookup" => json!(cells.lookup_rows(&req.path, &req.keys)?),
        "select" => json!(cells.select_all(&req.path)?),
        other => {
            return Err(ApiError::new(ErrorKind::NotFound, format!("unknown rows command {other:?}")));
        }
    };
    Ok(ApiResponse::ok(data))
}

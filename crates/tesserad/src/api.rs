//! HTTP control API and orchid.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/orchid/{*path}` | Resolve an orchid path |
//! | PUT | `/api/v1/config` | Apply a new dynamic config |
//! | POST | `/api/v1/users` | Register a user |
//! | PUT | `/api/v1/nodes/{address}` | Register or refresh a node |
//! | POST | `/api/v1/nodes/{address}/heartbeat` | Node heartbeat |
//! | POST | `/api/v1/nodes/{address}/ban` | Ban a node |
//! | POST | `/api/v1/pool_trees` | Create a pool tree |
//! | DELETE | `/api/v1/pool_trees/{tree}` | Remove a pool tree |
//! | POST | `/api/v1/pool_trees/{tree}/pools` | Create a pool |
//! | PUT | `/api/v1/pool_trees/{tree}/pools/{pool}` | Update a pool's config |
//! | DELETE | `/api/v1/pool_trees/{tree}/pools/{pool}` | Remove a pool |
//! | POST | `/api/v1/operations` | Start an operation |
//! | POST | `/api/v1/operations/{id}/{action}` | abort, complete, suspend or resume |
//! | POST | `/api/v1/operations/{id}/parameters` | Update per-tree parameters |
//! | POST | `/api/v1/bundles` | Create a tablet cell bundle |
//! | POST | `/api/v1/bundles/{name}/cells` | Create a cell in a bundle |
//! | POST | `/api/v1/tables` | Create a table |
//! | POST | `/api/v1/tables/{command}` | mount, frozen_mount, unmount, freeze, unfreeze, remount |
//! | POST | `/api/v1/tablet_actions` | Start a move or reshard action |
//! | POST | `/api/v1/rows/{command}` | insert, delete, lookup or select rows |

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Serialize;

use tessera_cells::CellError;
use tessera_core::{CoreError, ErrorKind};
use tessera_orchid::OrchidError;
use tessera_scheduler::SchedulerError;

use crate::controller::Controller;
use crate::handlers;

/// Response wrapper shared by every route.
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
        })
    }
}

/// An error from any subsystem, carried with its kind so the status code
/// and the client's retry decision agree.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }
}

pub fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound | ErrorKind::Resolve => StatusCode::NOT_FOUND,
        ErrorKind::Configuration => StatusCode::BAD_REQUEST,
        ErrorKind::AccessDenied => StatusCode::FORBIDDEN,
        ErrorKind::AlreadyExists
        | ErrorKind::InvalidState
        | ErrorKind::TabletNotMounted
        | ErrorKind::OperationHangup
        | ErrorKind::PrerequisiteTransactionAborted => StatusCode::CONFLICT,
        ErrorKind::ResourceLimitExceeded => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Throttled => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::SafeMode => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.message),
            kind: Some(self.kind),
        };
        (status_of(self.kind), Json(body)).into_response()
    }
}

macro_rules! from_kinded {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for ApiError {
                fn from(e: $err) -> Self {
                    Self::new(e.kind(), e.to_string())
                }
            }
        )*
    };
}

from_kinded!(SchedulerError, CellError, OrchidError, CoreError);

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Build the complete router over a controller.
pub fn build_router(controller: Controller) -> Router {
    let api_routes = Router::new()
        .route("/config", put(handlers::apply_config))
        .route("/users", post(handlers::add_user))
        .route("/nodes/{address}", put(handlers::upsert_node))
        .route("/nodes/{address}/heartbeat", post(handlers::node_heartbeat))
        .route("/nodes/{address}/ban", post(handlers::ban_node))
        .route("/pool_trees", post(handlers::create_pool_tree))
        .route("/pool_trees/{tree}", delete(handlers::remove_pool_tree))
        .route("/pool_trees/{tree}/pools", post(handlers::create_pool))
        .route(
            "/pool_trees/{tree}/pools/{pool}",
            put(handlers::update_pool).delete(handlers::remove_pool),
        )
        .route("/operations", post(handlers::start_operation))
        .route("/operations/{id}/parameters", post(handlers::update_operation_parameters))
        .route("/operations/{id}/{action}", post(handlers::operation_action))
        .route("/bundles", post(handlers::create_bundle))
        .route("/bundles/{name}/cells", post(handlers::create_cell))
        .route("/tables", post(handlers::create_table))
        .route("/tables/{command}", post(handlers::table_command))
        .route("/tablet_actions", post(handlers::create_tablet_action))
        .route("/rows/{command}", post(handlers::rows_command));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/orchid", get(handlers::orchid_root))
        .route("/orchid/{*path}", get(handlers::orchid_path))
        .with_state(controller)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_errors_are_not_found() {
        let err: ApiError = OrchidError::Resolve("/x".into()).into();
        assert_eq!(status_of(err.kind), StatusCode::NOT_FOUND);
        assert_eq!(status_of(ErrorKind::Throttled), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_of(ErrorKind::SafeMode), StatusCode::SERVICE_UNAVAILABLE);
    }
}

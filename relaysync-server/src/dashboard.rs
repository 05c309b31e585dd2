//! Read-only projections of the Store for the dashboard UI:
//! `/api/status`, `/api/queue`, `/api/events/pending`, `/api/events/waiting`,
//! `/api/sync-log`, plus the `/healthz` / `/readyz` probes. None of these
//! routes touch the writer path — they read through `Supervisor::store()`,
//! and run concurrently with the worker.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use relaysync_core::store::SyncLogFilters;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::state::AppState;

/// `GET /healthz` — always 200 if the process is alive.
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// `GET /readyz` — 200 iff the Store is open, the Worker task is running,
/// and at least one node is reachable.
pub async fn readyz(State(state): State<AppState>) -> StatusCode {
    if !state.supervisor.is_ready() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    if !state.supervisor.any_node_reachable().await {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

/// `GET /api/status` — overall queue depth and per-node reachability.
pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let store = state.supervisor.store();
    let queue_depth = store.queue_depth().await.map_err(relaysync_core::RelayError::from)?;
    Ok(Json(json!({
        "ready": state.supervisor.is_ready(),
        "queue_depth": queue_depth,
        "nodes": state.supervisor.configured_nodes().collect::<Vec<_>>(),
    })))
}

/// `GET /api/queue` — queue depth alone, for lightweight polling.
pub async fn queue(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let depth = state
        .supervisor
        .store()
        .queue_depth()
        .await
        .map_err(relaysync_core::RelayError::from)?;
    Ok(Json(json!({ "queue_depth": depth })))
}

/// `GET /api/events/pending` — rows in `pending` state.
pub async fn events_pending(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let rows = state
        .supervisor
        .store()
        .list_pending(Some("pending"))
        .await
        .map_err(relaysync_core::RelayError::from)?;
    Ok(Json(json!({ "events": rows })))
}

/// `GET /api/events/waiting` — rows in `waiting_item` state.
pub async fn events_waiting(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let rows = state
        .supervisor
        .store()
        .list_pending(Some("waiting_item"))
        .await
        .map_err(relaysync_core::RelayError::from)?;
    Ok(Json(json!({ "events": rows })))
}

#[derive(Debug, Deserialize)]
pub struct SyncLogQuery {
    source_node: Option<String>,
    target_node: Option<String>,
    success: Option<bool>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    100
}

/// `GET /api/sync-log` — append-only observability log, filterable by node
/// and success. Not consulted by the core pipeline — dashboard only.
pub async fn sync_log(
    State(state): State<AppState>,
    Query(query): Query<SyncLogQuery>,
) -> Result<Json<Value>, AppError> {
    let filters = SyncLogFilters {
        source_node: query.source_node,
        target_node: query.target_node,
        success: query.success,
    };
    let rows = state
        .supervisor
        .store()
        .query_sync_log(filters, query.limit, query.offset)
        .await
        .map_err(relaysync_core::RelayError::from)?;
    Ok(Json(json!({ "entries": rows })))
}

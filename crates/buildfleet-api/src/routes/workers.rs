//! Worker pool and maintenance endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use buildfleet_core::id::{WorkerId, WorkerKind};
use buildfleet_core::maintenance::MaintenanceOperation;
use buildfleet_core::worker::Worker;
use chrono::Utc;
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workers))
        .route("/{kind}/{id}", get(get_worker))
        .route(
            "/{kind}/{id}/maintenance",
            get(list_worker_operations).post(request_maintenance),
        )
}

pub fn operations_router() -> Router<AppState> {
    Router::new().route("/", get(list_operations))
}

fn worker_id(kind: &str, id: i64) -> Result<WorkerId, ApiError> {
    let kind: WorkerKind = kind.parse()?;
    Ok(WorkerId { kind, id })
}

async fn list_workers(State(state): State<AppState>) -> Result<Json<Vec<Worker>>, ApiError> {
    Ok(Json(state.pool.list_workers().await?))
}

async fn get_worker(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
) -> Result<Json<Worker>, ApiError> {
    let id = worker_id(&kind, id)?;
    Ok(Json(state.pool.get_worker(id).await?))
}

#[derive(Debug, Deserialize)]
struct MaintenanceRequest {
    requested_by: String,
}

async fn request_maintenance(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
    Json(req): Json<MaintenanceRequest>,
) -> Result<Json<MaintenanceOperation>, ApiError> {
    let id = worker_id(&kind, id)?;
    if req.requested_by.trim().is_empty() {
        return Err(ApiError::BadRequest("requested_by must not be empty".to_string()));
    }
    let op = state
        .maintenance
        .request_maintenance(id, &req.requested_by, Utc::now())
        .await?;
    Ok(Json(op))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_worker_operations(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<MaintenanceOperation>>, ApiError> {
    let id = worker_id(&kind, id)?;
    let ops = state
        .maintenance
        .list_operations(Some(id), query.limit.clamp(1, 500))
        .await?;
    Ok(Json(ops))
}

async fn list_operations(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<MaintenanceOperation>>, ApiError> {
    let ops = state
        .maintenance
        .list_operations(None, query.limit.clamp(1, 500))
        .await?;
    Ok(Json(ops))
}

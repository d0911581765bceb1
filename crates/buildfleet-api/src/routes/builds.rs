//! Build endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use buildfleet_core::id::BuildKey;
use buildfleet_core::job::Job;
use buildfleet_core::project::{Build, NewBuild};
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(enqueue_build))
        .route("/{project}/{build}", get(get_build))
}

#[derive(Debug, Serialize)]
struct BuildResponse {
    #[serde(flatten)]
    build: Build,
    jobs: Vec<Job>,
}

async fn enqueue_build(
    State(state): State<AppState>,
    Json(req): Json<NewBuild>,
) -> Result<(StatusCode, Json<Build>), ApiError> {
    let build = state.scheduler.enqueue(req).await?;
    Ok((StatusCode::CREATED, Json(build)))
}

async fn get_build(
    State(state): State<AppState>,
    Path((project, build)): Path<(i64, i64)>,
) -> Result<Json<BuildResponse>, ApiError> {
    let (build, jobs) = state
        .scheduler
        .get_build(BuildKey::new(project, build))
        .await?;
    Ok(Json(BuildResponse { build, jobs }))
}

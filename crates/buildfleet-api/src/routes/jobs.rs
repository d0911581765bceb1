//! Job endpoints: the worker output/completion channel and operator reads.
//!
//! Write endpoints require the job's connect credential as a bearer token.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use buildfleet_core::id::JobKey;
use buildfleet_core::job::{Job, JobOutcome};
use buildfleet_core::output::SectionStatus;
use buildfleet_scheduler::{OutputChunk, SectionSummary};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::auth::WorkerCredential;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{project}/{build}/{job}", get(get_job))
        .route("/{project}/{build}/{job}/cancel", post(cancel_job))
        .route("/{project}/{build}/{job}/complete", post(complete_job))
        .route(
            "/{project}/{build}/{job}/sections",
            get(list_sections).post(open_section),
        )
        .route("/{project}/{build}/{job}/sections/{section}", get(read_output))
        .route(
            "/{project}/{build}/{job}/sections/{section}/output",
            post(append_output),
        )
        .route(
            "/{project}/{build}/{job}/sections/{section}/close",
            post(close_section),
        )
}

fn job_key((project, build, job): (i64, i64, i64)) -> JobKey {
    JobKey::new(project, build, job)
}

async fn get_job(
    State(state): State<AppState>,
    Path(path): Path<(i64, i64, i64)>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.scheduler.get_job(job_key(path)).await?))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(path): Path<(i64, i64, i64)>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.scheduler.cancel_job(job_key(path)).await?))
}

async fn complete_job(
    State(state): State<AppState>,
    Path(path): Path<(i64, i64, i64)>,
    WorkerCredential(credential): WorkerCredential,
    Json(outcome): Json<JobOutcome>,
) -> Result<Json<Job>, ApiError> {
    let job = state
        .scheduler
        .complete_job(job_key(path), &credential, outcome)
        .await?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
struct OpenSectionRequest {
    name: String,
}

#[derive(Debug, Serialize)]
struct OpenSectionResponse {
    section_id: i64,
}

async fn open_section(
    State(state): State<AppState>,
    Path(path): Path<(i64, i64, i64)>,
    WorkerCredential(credential): WorkerCredential,
    Json(req): Json<OpenSectionRequest>,
) -> Result<Json<OpenSectionResponse>, ApiError> {
    let section_id = state
        .output
        .open_section(job_key(path), &credential, &req.name)
        .await?;
    Ok(Json(OpenSectionResponse { section_id }))
}

#[derive(Debug, Serialize)]
struct AppendResponse {
    accepted: usize,
}

/// The body is the raw output text.
async fn append_output(
    State(state): State<AppState>,
    Path((project, build, job, section)): Path<(i64, i64, i64, i64)>,
    WorkerCredential(credential): WorkerCredential,
    text: String,
) -> Result<Json<AppendResponse>, ApiError> {
    let accepted = state
        .output
        .append_output(JobKey::new(project, build, job), &credential, section, &text)
        .await?;
    Ok(Json(AppendResponse { accepted }))
}

#[derive(Debug, Deserialize)]
struct CloseSectionRequest {
    status: SectionStatus,
}

async fn close_section(
    State(state): State<AppState>,
    Path((project, build, job, section)): Path<(i64, i64, i64, i64)>,
    WorkerCredential(credential): WorkerCredential,
    Json(req): Json<CloseSectionRequest>,
) -> Result<Json<SectionSummary>, ApiError> {
    let summary = state
        .output
        .close_section(JobKey::new(project, build, job), &credential, section, req.status)
        .await?;
    Ok(Json(summary))
}

async fn list_sections(
    State(state): State<AppState>,
    Path(path): Path<(i64, i64, i64)>,
) -> Result<Json<Vec<SectionSummary>>, ApiError> {
    Ok(Json(state.output.read_sections(job_key(path)).await?))
}

#[derive(Debug, Deserialize)]
struct ReadQuery {
    #[serde(default)]
    offset: usize,
}

async fn read_output(
    State(state): State<AppState>,
    Path((project, build, job, section)): Path<(i64, i64, i64, i64)>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<OutputChunk>, ApiError> {
    let chunk = state
        .output
        .read_output(JobKey::new(project, build, job), section, query.offset)
        .await?;
    Ok(Json(chunk))
}

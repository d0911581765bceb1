//! API routes.

pub mod builds;
pub mod health;
pub mod jobs;
pub mod workers;

use crate::AppState;
use crate::ws::ws_handler;
use axum::Router;
use axum::routing::get;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .route("/ws", get(ws_handler))
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/builds", builds::router())
        .nest("/jobs", jobs::router())
        .nest("/workers", workers::router())
        .nest("/maintenance", workers::operations_router())
}

//! HTTP control plane.
//!
//! `POST /cir/run` with `{"task": "<goal>"}` runs one repair loop to
//! completion and returns the structured result. An empty task is a 400.
//! The handler never surfaces an error body — failures come back as a
//! structured result with `success: false`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tracing::info;

use crate::orchestrator::{CirResult, Orchestrator};

#[derive(Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    task: String,
}

/// Build the API router.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/cir/run", post(run_cir))
        .with_state(orchestrator)
}

async fn health() -> &'static str {
    "ok"
}

async fn run_cir(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(request): Json<RunRequest>,
) -> Result<Json<CirResult>, StatusCode> {
    let task = request.task.trim();
    if task.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    info!(task = %task, "Control plane accepted repair run");
    let result = orchestrator.run_task(task).await;
    Ok(Json(result))
}

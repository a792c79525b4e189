//! Solution routes: assemble, inspect, suspend, resume, release.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use qcc_core::{AssemblyContext, CapabilityRequirement, Solution, SolutionId};
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/solutions", post(assemble).get(list_solutions))
        .route("/solutions/{id}", get(get_solution).delete(release_solution))
        .route("/solutions/{id}/suspend", post(suspend_solution))
        .route("/solutions/{id}/resume", post(resume_solution))
}

#[derive(Deserialize)]
struct AssembleRequest {
    requirements: Vec<CapabilityRequirement>,
    #[serde(default)]
    context: AssemblyContext,
}

/// POST /api/solutions: assemble and wait for the active solution.
async fn assemble(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AssembleRequest>,
) -> Result<(StatusCode, Json<Solution>), ApiError> {
    let solution = state.assembler.assemble(body.requirements, body.context).await?;
    Ok((StatusCode::CREATED, Json(solution)))
}

/// GET /api/solutions: ids of solutions still assembling or holding cells.
async fn list_solutions(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let ids = state.assembler.solution_ids();
    Json(serde_json::json!({
        "solutions": ids,
        "count": ids.len(),
    }))
}

/// GET /api/solutions/{id}
async fn get_solution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Solution>, ApiError> {
    let id: SolutionId = id.parse()?;
    Ok(Json(state.assembler.status(id).await?))
}

/// POST /api/solutions/{id}/suspend
async fn suspend_solution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Solution>, ApiError> {
    let id: SolutionId = id.parse()?;
    Ok(Json(state.assembler.suspend(id).await?))
}

/// POST /api/solutions/{id}/resume
async fn resume_solution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Solution>, ApiError> {
    let id: SolutionId = id.parse()?;
    Ok(Json(state.assembler.resume(id).await?))
}

/// DELETE /api/solutions/{id}: release; repeating it is harmless.
async fn release_solution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id: SolutionId = id.parse()?;
    state.assembler.release(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

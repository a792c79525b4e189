//! Assembler status route.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use qcc_runtime::AssemblerStatus;

use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/status", get(get_status))
}

/// GET /api/status: counters, committed resources and providers.
async fn get_status(State(state): State<Arc<AppState>>) -> Json<AssemblerStatus> {
    Json(state.assembler.assembler_status())
}

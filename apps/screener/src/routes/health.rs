use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
/// Returns service status, the scheduler state and the number of failed
/// state writes since start.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let faults = state.queues().persistence_faults();
    let scheduler = state.engine.status().await.scheduler;
    Json(json!({
        "status": if faults == 0 { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "service": env!("CARGO_PKG_NAME"),
        "scheduler": scheduler,
        "persistence_faults": faults
    }))
}

pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::pipeline::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Submission and progress
        .route("/api/v1/batches", post(handlers::handle_submit))
        .route(
            "/api/v1/batches/:batch_id",
            get(handlers::handle_batch_progress),
        )
        .route("/api/v1/status", get(handlers::handle_status))
        // Items
        .route("/api/v1/items/:id", get(handlers::handle_item))
        .route(
            "/api/v1/items/:id/result",
            get(handlers::handle_result).delete(handlers::handle_take_result),
        )
        .route("/api/v1/items/:id/retry", post(handlers::handle_retry))
        // Engine control
        .route("/api/v1/dispatch", post(handlers::handle_dispatch))
        .route(
            "/api/v1/engine/config",
            get(handlers::handle_get_config).patch(handlers::handle_update_config),
        )
        .route("/api/v1/engine/pause", post(handlers::handle_pause))
        .route("/api/v1/engine/resume", post(handlers::handle_resume))
        .route("/api/v1/session/reset", post(handlers::handle_reset))
        .with_state(state)
}

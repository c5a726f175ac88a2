use std::sync::Arc;

use crate::pipeline::manager::RetryQueueManager;
use crate::pipeline::Orchestrator;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(engine: Arc<Orchestrator>) -> Self {
        Self { engine }
    }

    pub fn queues(&self) -> &RetryQueueManager {
        self.engine.manager()
    }
}

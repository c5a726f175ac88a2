//! Generation Client contract: one request to the analysis service.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::pipeline::queues::FailureClass;

#[derive(Debug, Error)]
pub enum GenerationError {
    /// Network error, rate limit, 5xx.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    /// Any other refusal by the service; routed like a transient failure.
    #[error("request rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },
}

impl GenerationError {
    pub fn class(&self) -> FailureClass {
        match self {
            GenerationError::Timeout(_) => FailureClass::Timeout,
            GenerationError::Transient(_) | GenerationError::Rejected { .. } => {
                FailureClass::Transient
            }
        }
    }
}

/// Carried by the orchestrator as `Arc<dyn GenerationClient>` so the HTTP
/// client can be swapped for a scripted one in tests.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Identifier of the model answering requests; drives the timeout class.
    fn model_id(&self) -> &str;

    async fn generate(&self, payload: &str, deadline: Duration) -> Result<String, GenerationError>;
}

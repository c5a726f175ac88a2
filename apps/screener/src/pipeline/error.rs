use thiserror::Error;

use crate::pipeline::item::QueueKind;
use crate::pipeline::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The snapshot write failed; the transition was rolled back.
    #[error("persistence fault: {0}")]
    Persistence(#[from] StoreError),

    #[error("unknown work item '{0}'")]
    UnknownItem(String),

    #[error("cannot {action} item '{id}' while it is in {from:?}")]
    InvalidTransition {
        id: String,
        from: QueueKind,
        action: &'static str,
    },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

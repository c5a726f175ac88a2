// Resume batch engine: queues, classification, deadlines, persistence and the
// scheduling loop. The HTTP layer in `handlers` is a thin adapter over
// `Orchestrator` and `RetryQueueManager`.

pub mod backoff;
pub mod classifier;
pub mod client;
pub mod error;
pub mod handlers;
pub mod item;
pub mod manager;
pub mod orchestrator;
pub mod queues;
pub mod settings;
pub mod status;
pub mod store;
pub mod timeout_policy;

pub use error::EngineError;
pub use orchestrator::Orchestrator;

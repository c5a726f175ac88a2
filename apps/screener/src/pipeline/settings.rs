//! Runtime-adjustable engine settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::error::{EngineError, EngineResult};
use crate::pipeline::timeout_policy::TimeoutPolicy;

/// Longest deadline any setting may ask for (24 hours).
pub const MAX_TIMEOUT_LIMIT_SECS: u64 = 24 * 60 * 60;

/// What to do with a complete record that scores below the quality minimum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LowQualityPolicy {
    /// Treat it as a formatting failure and try again.
    #[default]
    Retry,
    /// Keep it as the result, with a warning in its issues.
    Accept,
}

impl LowQualityPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "retry" => Some(LowQualityPolicy::Retry),
            "accept" => Some(LowQualityPolicy::Accept),
            _ => None,
        }
    }
}

/// Picked up by the next scheduling tick; calls already in flight keep the
/// settings they were dispatched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub fast_timeout_secs: u64,
    pub slow_timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub max_retries: u32,
    pub concurrency_limit: usize,
    /// Most items a single tick dispatches.
    pub batch_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fast_timeout_secs: 60,
            slow_timeout_secs: 180,
            max_timeout_secs: 600,
            max_retries: 3,
            concurrency_limit: 2,
            batch_size: 5,
        }
    }
}

impl EngineSettings {
    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            fast: Duration::from_secs(self.fast_timeout_secs),
            slow: Duration::from_secs(self.slow_timeout_secs),
            max: Duration::from_secs(self.max_timeout_secs),
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |msg: &str| Err(EngineError::InvalidSettings(msg.to_string()));
        if self.fast_timeout_secs == 0 || self.slow_timeout_secs == 0 {
            return invalid("timeouts must be at least one second");
        }
        if self.max_timeout_secs > MAX_TIMEOUT_LIMIT_SECS {
            return invalid("max_timeout_secs must not exceed 86400");
        }
        if self.max_timeout_secs < self.fast_timeout_secs.max(self.slow_timeout_secs) {
            return invalid("max_timeout_secs must not be below the base timeouts");
        }
        if self.max_retries == 0 {
            return invalid("max_retries must be at least 1");
        }
        if self.concurrency_limit == 0 || self.batch_size == 0 {
            return invalid("concurrency_limit and batch_size must be at least 1");
        }
        Ok(())
    }

    /// Returns the settings with every provided field replaced.
    pub fn apply(&self, update: &SettingsUpdate) -> EngineResult<Self> {
        let next = Self {
            fast_timeout_secs: update.fast_timeout_secs.unwrap_or(self.fast_timeout_secs),
            slow_timeout_secs: update.slow_timeout_secs.unwrap_or(self.slow_timeout_secs),
            max_timeout_secs: update.max_timeout_secs.unwrap_or(self.max_timeout_secs),
            max_retries: update.max_retries.unwrap_or(self.max_retries),
            concurrency_limit: update.concurrency_limit.unwrap_or(self.concurrency_limit),
            batch_size: update.batch_size.unwrap_or(self.batch_size),
        };
        next.validate()?;
        Ok(next)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub fast_timeout_secs: Option<u64>,
    pub slow_timeout_secs: Option<u64>,
    pub max_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub concurrency_limit: Option<usize>,
    pub batch_size: Option<usize>,
}

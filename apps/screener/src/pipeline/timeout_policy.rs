//! Timeout Policy: per-attempt deadlines from model class, wave size and
//! document length.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Extra time per additional item dispatched in the same wave.
const BATCH_FACTOR: f64 = 0.25;
/// Documents of this many characters get 50% more time.
const LENGTH_UNIT_CHARS: f64 = 8000.0;
const LENGTH_FACTOR: f64 = 0.5;

/// Identifier fragments used by reasoning-family models.
const REASONING_MARKERS: &[&str] = &["reasoning", "thinking", "-r1", "deepseek-r"];
const REASONING_PREFIXES: &[&str] = &["o1", "o3", "o4"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelClass {
    Fast,
    /// Reasoning models that think before answering.
    Slow,
}

impl ModelClass {
    /// Detects the class from a model identifier such as `o3-mini` or
    /// `claude-sonnet-4-5`.
    pub fn from_model_id(model_id: &str) -> Self {
        let id = model_id.trim().to_lowercase();
        let is_reasoning = REASONING_PREFIXES.iter().any(|p| {
            id.strip_prefix(p)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('-'))
        }) || REASONING_MARKERS.iter().any(|m| id.contains(m));
        if is_reasoning {
            ModelClass::Slow
        } else {
            ModelClass::Fast
        }
    }

    /// Parses a declared class (`fast`, `slow`, `reasoning`).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "fast" => Some(ModelClass::Fast),
            "slow" | "reasoning" => Some(ModelClass::Slow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    pub fast: Duration,
    pub slow: Duration,
    pub max: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(60),
            slow: Duration::from_secs(180),
            max: Duration::from_secs(600),
        }
    }
}

impl TimeoutPolicy {
    pub fn deadline_for(
        &self,
        model_class: ModelClass,
        batch_size: usize,
        payload_length: usize,
    ) -> Duration {
        let base = match model_class {
            ModelClass::Fast => self.fast,
            ModelClass::Slow => self.slow,
        };
        let batch_scale = 1.0 + BATCH_FACTOR * batch_size.saturating_sub(1) as f64;
        let length_scale = 1.0 + LENGTH_FACTOR * (payload_length as f64 / LENGTH_UNIT_CHARS);
        let secs = base.as_secs_f64() * batch_scale * length_scale;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(self.max)
    }
}

//! Per-queue retry policies: `delay = min(base * multiplier^attempts + jitter, cap)`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::pipeline::item::QueueKind;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: f64,
    /// Upper bound of the uniformly sampled jitter added to each delay.
    pub jitter: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    /// No waiting at all; items are eligible again on the next tick.
    #[cfg(test)]
    pub const IMMEDIATE: RetryPolicy = RetryPolicy {
        base: Duration::ZERO,
        multiplier: 1.0,
        jitter: Duration::ZERO,
        cap: Duration::ZERO,
    };

    /// Samples jitter and returns the delay for an item that has been
    /// dispatched `attempts` times.
    pub fn delay(&self, attempts: u32) -> Duration {
        let fraction = if self.jitter.is_zero() {
            0.0
        } else {
            rand::thread_rng().gen_range(0.0..=1.0)
        };
        self.delay_with_jitter(attempts, fraction)
    }

    /// Deterministic form of [`delay`](Self::delay); `jitter_fraction` in [0, 1].
    pub fn delay_with_jitter(&self, attempts: u32, jitter_fraction: f64) -> Duration {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let scaled = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let jitter = self.jitter.as_secs_f64() * jitter_fraction.clamp(0.0, 1.0);
        let secs = scaled + jitter;
        if !secs.is_finite() || secs >= self.cap.as_secs_f64() {
            return self.cap;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// The three retry classes each back off independently.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicies {
    pub quick: RetryPolicy,
    pub long: RetryPolicy,
    pub format: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            // network errors and rate limits: seconds to a couple of minutes
            quick: RetryPolicy {
                base: Duration::from_secs(5),
                multiplier: 2.0,
                jitter: Duration::from_secs(3),
                cap: Duration::from_secs(120),
            },
            // deadline exceeded: minutes
            long: RetryPolicy {
                base: Duration::from_secs(120),
                multiplier: 2.0,
                jitter: Duration::from_secs(30),
                cap: Duration::from_secs(1800),
            },
            // upstream answered, prompt-level retry
            format: RetryPolicy {
                base: Duration::from_secs(2),
                multiplier: 1.5,
                jitter: Duration::from_secs(1),
                cap: Duration::from_secs(60),
            },
        }
    }
}

impl RetryPolicies {
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            quick: RetryPolicy::IMMEDIATE,
            long: RetryPolicy::IMMEDIATE,
            format: RetryPolicy::IMMEDIATE,
        }
    }

    /// Policy for a retry queue; `None` for non-retry queues.
    pub fn for_queue(&self, queue: QueueKind) -> Option<&RetryPolicy> {
        match queue {
            QueueKind::QuickRetry => Some(&self.quick),
            QueueKind::LongRetry => Some(&self.long),
            QueueKind::FormatRetry => Some(&self.format),
            _ => None,
        }
    }
}

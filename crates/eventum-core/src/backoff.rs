//! Idle backoff policy.

use crate::config::BackoffConfig;
use std::time::Duration;

/// Geometric backoff: each step multiplies the current delay by a fixed
/// factor, capped at a ceiling. Pure; the engine decides when to sleep
/// and how the sleep is interrupted.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base: Duration,
    multiplier: f64,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            base,
            multiplier,
            max: max.max(base),
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.base_delay(), config.multiplier, config.max_delay())
    }

    /// The delay a fresh backoff sequence starts from
    pub fn initial(&self) -> Duration {
        self.base
    }

    /// The ceiling no delay exceeds
    pub fn max(&self) -> Duration {
        self.max
    }

    /// The delay following `current`: `min(current * multiplier, max)`
    pub fn next(&self, current: Duration) -> Duration {
        self.max.min(current.mul_f64(self.multiplier))
    }
}

//! Retry and polling backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with cap and jitter.
///
/// The delay for attempt `n` (1-based) is
/// `base_delay * multiplier^(n-1)`, clamped to `max_delay`, with a
/// uniform jitter of up to `jitter` (a ratio) applied in both
/// directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Multiplier for each further attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter ratio in `[0, 1]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_jitter() -> f64 {
    0.2
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffConfig {
    /// Backoff used for delegated-job polling: 250 ms doubling up to the
    /// given cap.
    #[must_use]
    pub fn for_polling(max_interval: Duration, jitter: f64) -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: max_interval,
            multiplier: 2.0,
            jitter,
        }
    }

    /// Deterministic delay for an attempt, before jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_possible_wrap)] // attempt count won't exceed i32
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(raw).min(self.max_delay)
    }

    /// Jittered delay for an attempt.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt).as_secs_f64();
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let spread = base * self.jitter;
        let jittered = rand::thread_rng().gen_range((base - spread).max(0.0)..=base + spread);
        Duration::from_secs_f64(jittered)
    }
}

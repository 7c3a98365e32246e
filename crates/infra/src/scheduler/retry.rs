//! Redelivery budget for failed trigger deliveries.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// Doubles per attempt.
    #[default]
    Exponential,
    /// Grows by `base` per attempt.
    Linear,
}

impl BackoffStrategy {
    /// Un-jittered delay after the `attempt`-th failure (1-indexed), capped at `cap`.
    fn delay(self, base: Duration, cap: Duration, attempt: u32) -> Duration {
        let raw = match self {
            BackoffStrategy::Fixed => Some(base),
            BackoffStrategy::Linear => base.checked_mul(attempt),
            BackoffStrategy::Exponential => 2u32
                .checked_pow(attempt.saturating_sub(1))
                .and_then(|factor| base.checked_mul(factor)),
        };
        raw.map_or(cap, |d| d.min(cap))
    }
}

/// Retry budget and backoff applied by the trigger dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before dead-lettering (0 = the first failure dead-letters).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffStrategy,
    /// Fraction of the delay (0.0..=1.0) added or subtracted at random.
    /// Out-of-range values are clamped; NaN means no jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            backoff: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter_fraction(jitter);
        self
    }

    /// Delay before the next attempt after `attempt` failures.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = self.backoff.delay(self.base_delay, self.max_delay, attempt);
        let spread = delay.mul_f64(jitter_fraction(self.jitter));
        if spread.is_zero() {
            return delay;
        }

        let low = delay.saturating_sub(spread);
        let high = delay.saturating_add(spread);
        rand::thread_rng().gen_range(low..=high)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

// `Duration::mul_f64` panics on NaN and negative factors.
fn jitter_fraction(jitter: f64) -> f64 {
    if jitter.is_nan() {
        0.0
    } else {
        jitter.clamp(0.0, 1.0)
    }
}

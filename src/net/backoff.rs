//! Exponential backoff with jitter
//!
//! Delay for attempt n is `min(base * multiplier^n, max)` with uniform
//! ±10% jitter applied after capping, clamped so a jittered delay never
//! drops below `base`.

use std::time::Duration;

/// Default initial delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Default delay cap
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
/// Default growth factor
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
/// Jitter fraction applied after capping
pub const JITTER_FACTOR: f64 = 0.1;

/// Stateful exponential backoff
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MULTIPLIER)
    }
}

impl ExponentialBackoff {
    /// Create a backoff with explicit parameters
    pub fn new(base: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            base,
            max,
            multiplier,
            attempt: 0,
        }
    }

    /// Delay for a specific attempt number without advancing state
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.base.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max.as_secs_f64());

        let jitter_range = capped * JITTER_FACTOR;
        let jitter = (fastrand::f64() - 0.5) * 2.0 * jitter_range;
        let jittered = (capped + jitter).max(self.base.as_secs_f64());

        Duration::from_secs_f64(jittered)
    }

    /// Delay for the current attempt, advancing the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Attempts taken since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Restore the backoff to its initial state
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

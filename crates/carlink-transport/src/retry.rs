//! Connect retry policy

use std::time::Duration;

/// How often, and how patiently, a driver retries a failed connect.
///
/// The wait before retry `n` (0-based) is `initial_delay` for the first
/// retry, then `interval * backoff^(n-1)`, capped at `max_interval`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total connect attempts, including the first
    pub max_attempts: u32,
    /// Wait before the first retry
    pub initial_delay: Duration,
    /// Wait before later retries
    pub interval: Duration,
    /// Growth factor for `interval` (1.0 = fixed)
    pub backoff: f64,
    /// Upper bound for any wait
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    /// Network transports: 30 attempts, 5 seconds apart
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_delay: Duration::from_millis(5000),
            interval: Duration::from_millis(5000),
            backoff: 1.0,
            max_interval: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// USB accessory endpoints: 5 attempts, 3 seconds then 2 seconds apart
    pub fn accessory() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(3000),
            interval: Duration::from_millis(2000),
            backoff: 1.0,
            max_interval: Duration::from_millis(2000),
        }
    }

    /// Fixed delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            interval: delay,
            backoff: 1.0,
            max_interval: delay,
        }
    }

    /// Doubling delay between attempts
    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: initial,
            interval: initial.saturating_mul(2),
            backoff: 2.0,
            max_interval: max,
        }
    }

    /// Wait before retry number `retry` (0 = first retry)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = if retry == 0 {
            self.initial_delay
        } else {
            let factor = self.backoff.max(1.0).powi(retry as i32 - 1);
            self.interval.mul_f64(factor.min(u32::MAX as f64))
        };
        delay.min(self.max_interval.max(self.initial_delay))
    }
}

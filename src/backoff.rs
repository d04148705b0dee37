use rand::Rng;
use std::time::Duration;

/// Retry attempts allowed for transient failures, on top of the first try.
/// Applies to both page fetches and robots.txt fetches.
pub const MAX_RETRIES: u32 = 2;

/// Exponential backoff with proportional jitter
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_percent: u64,
}

impl ExponentialBackoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_percent: 20,
        }
    }

    /// Profile used for HTTP retries within a task
    pub const fn for_http() -> Self {
        Self::new(250, 5_000)
    }

    /// Profile used for robots.txt retries; shorter because robots gates
    /// every other fetch for its authority
    pub const fn for_robots() -> Self {
        Self::new(100, 2_000)
    }

    pub const fn with_jitter(mut self, jitter_percent: u64) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(16)));
        let capped = exponential.min(self.max_ms);
        let jitter = if self.jitter_percent > 0 {
            let span = capped * self.jitter_percent / 100;
            rand::thread_rng().gen_range(0..=span)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}

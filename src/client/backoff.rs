use std::time::Duration;

/// Reconnect schedule: `min(base * 2^attempt, max)`, for at most `max_attempts` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay before retry number `attempt` (zero-based), or `None` once retries are used up.
    pub fn next(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then(|| self.delay(attempt))
    }
}

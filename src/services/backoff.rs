use rand::Rng;
use std::time::Duration;

/// Retry delay schedule for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Upper bound of the delay after `attempt` failures: base * 2^(attempt-1), capped
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay with random jitter in [ceiling/2, ceiling]
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        let floor = ceiling / 2;
        let millis = rand::rng().random_range(floor..=ceiling);
        Duration::from_millis(millis)
    }

    /// Wall-clock deadline for the next attempt
    pub fn next_attempt_at(&self, attempt: u32) -> chrono::DateTime<chrono::Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max.as_secs() as i64));
        chrono::Utc::now() + delay
    }
}

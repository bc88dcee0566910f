use std::time::Duration;

/// Exponential backoff policy for reconnect loops.
///
/// Jitter is supplied by the caller so the policy stays deterministic under
/// test; production callers draw it uniformly from `0..=1000` ms.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before reconnect attempt `attempt` (1-based), or `None` when the
    /// attempt budget is exhausted and the caller must surface a fatal
    /// connectivity error instead of scheduling.
    pub fn delay_for_attempt(&self, attempt: u32, jitter_ms: u64) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let shift = (attempt - 1).min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self
            .base_delay_ms
            .saturating_mul(multiplier)
            .saturating_add(jitter_ms);
        Some(Duration::from_millis(calculated.min(self.max_delay_ms)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1_000, 30_000, 10)
    }
}

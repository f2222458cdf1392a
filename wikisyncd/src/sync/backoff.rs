use std::time::Duration;

use rand::Rng;

/// Exponent cap; with the default 60 s base the ceiling is 16 minutes.
const MAX_DOUBLINGS: u32 = 4;

/// Attempt ceiling plus the jittered exponential delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `attempt` is 1-based: the attempt that just failed.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    /// Half of the exponential step is fixed, the other half random.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let doublings = attempt.saturating_sub(1).min(MAX_DOUBLINGS);
        let step = base_ms.saturating_mul(1 << doublings);
        let half = step / 2;
        Duration::from_millis(half + rng.gen_range(0..=step - half))
    }
}

use serde::Serialize;
use std::cmp;
use std::time::Duration;

/// Longest wait a server retry-after hint can impose.
pub const RETRY_AFTER_CEILING: Duration = Duration::from_secs(24 * 60 * 60);

/// Exponential delay between failed delivery attempts.
///
/// The n-th consecutive failure waits `base * 2^(n-1)`, capped at `max`.
/// A server retry-after hint wins when it asks for longer and is honored past
/// `max`, up to [`RETRY_AFTER_CEILING`].
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackoffSnapshot {
    pub consecutive_failures: u32,
    pub next_delay_secs: u64,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: cmp::max(base, max),
            failures: 0,
        }
    }

    /// The delay the next failure would schedule.
    pub fn current_delay(&self) -> Duration {
        compute_delay(self.base, self.max, self.failures)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a failure and returns how long to wait before the next attempt.
    pub fn on_failure(&mut self, retry_after: Option<Duration>) -> Duration {
        let computed = self.current_delay();
        self.failures = self.failures.saturating_add(1);
        match retry_after {
            Some(hint) => cmp::max(computed, cmp::min(hint, RETRY_AFTER_CEILING)),
            None => computed,
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn snapshot(&self) -> BackoffSnapshot {
        BackoffSnapshot {
            consecutive_failures: self.failures,
            next_delay_secs: self.current_delay().as_secs(),
        }
    }
}

fn compute_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    // 2^20 * base already exceeds any sane cap; avoid overflow past that.
    let exponent = cmp::min(failures, 20);
    let factor = 1u32 << exponent;
    let delay = base.checked_mul(factor).unwrap_or(max);
    cmp::min(delay, max)
}

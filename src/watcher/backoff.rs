//! Jittered exponential backoff.

use super::BackoffPolicy;
use std::time::Duration;

pub(crate) struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next retry; doubles per attempt up to the cap.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(20);
        self.attempt = self.attempt.saturating_add(1);

        let capped = self
            .policy
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.policy.max_delay_ms.max(self.policy.base_delay_ms));

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        let shaved = (capped as f64 * jitter * fastrand::f64()) as u64;
        Duration::from_millis(capped - shaved.min(capped))
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

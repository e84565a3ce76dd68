use std::time::Duration;

/// Capped exponential backoff for transient invocation failures.
///
/// The delay after the n-th retry is `min(cap, base * 2^n)`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        BackoffPolicy {
            base,
            cap: if cap.is_zero() { base } else { cap },
        }
    }

    pub fn delay_for(&self, retries_used: u32) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }

        // Shift is bounded; the cap flattens the curve long before 2^6.
        let factor = 1u128 << retries_used.min(6);
        let delay_ms = self.base.as_millis().saturating_mul(factor);
        let capped = delay_ms.min(self.cap.as_millis());
        Duration::from_millis(capped as u64)
    }
}

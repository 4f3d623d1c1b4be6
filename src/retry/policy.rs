use std::time::Duration;

/// Strategy for retrying transient failures with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts including the first request.
    pub max_attempts: u32,
    /// Base delay for the first retry.
    pub base_delay: Duration,
    /// Maximum delay cap for later retries.
    pub max_delay: Duration,
    /// Jitter ratio (0.0..=1.0) applied to delay.
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    /// Policy for outbound provider requests: up to 3 attempts,
    /// 250 ms · 2^(attempt-1) between them.
    pub fn provider_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter_ratio: 0.10,
        }
    }

    /// Policy for remote tenant-store fetches: base 100 ms, cap 5 s,
    /// up to 15 attempts.
    pub fn remote_store_default() -> Self {
        Self {
            max_attempts: 15,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter_ratio: 0.10,
        }
    }

    /// Exponential backoff delay for the given retry index (1-based).
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let shift = retry_index.saturating_sub(1).min(31);
        let multiplier = 1u32 << shift;
        let base = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        base.min(self.max_delay)
    }

    /// Apply jitter to a delay using a symmetric random range.
    pub fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let millis = delay.as_millis() as f64;
        let spread = millis * ratio;
        let low = (millis - spread).max(0.0);
        let high = millis + spread;
        let sampled = if high <= low {
            low
        } else {
            rand::random::<f64>() * (high - low) + low
        };
        Duration::from_millis(sampled.round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(1500),
            jitter_ratio: 0.0,
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(250));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(1500));
    }

    #[test]
    fn remote_store_policy_matches_contract() {
        let policy = RetryPolicy::remote_store_default();
        assert_eq!(policy.max_attempts, 15);
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(15), Duration::from_secs(5));
    }
}

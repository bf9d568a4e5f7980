use std::time::Duration;

/// Retry budget of the chunk transfer client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per chunk, the first one included.
    pub max_attempts_per_chunk: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Upper bound on a single chunk request.
    pub attempt_timeout: Duration,
    /// Upper bound on a whole session, checked between chunks.
    pub session_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts_per_chunk: 8,
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(120),
            session_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th failure:
    /// `min(base * 2^(attempt - 1), cap)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }

    pub fn allows_another_attempt(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts_per_chunk.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = RetryPolicy {
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_millis(500),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(60), Duration::from_millis(500));
    }

    #[test]
    fn attempt_budget_counts_first_try() {
        let policy = RetryPolicy {
            max_attempts_per_chunk: 3,
            ..RetryPolicy::default()
        };
        assert!(policy.allows_another_attempt(2));
        assert!(!policy.allows_another_attempt(3));

        let zero = RetryPolicy {
            max_attempts_per_chunk: 0,
            ..RetryPolicy::default()
        };
        assert!(zero.allows_another_attempt(0));
        assert!(!zero.allows_another_attempt(1));
    }
}

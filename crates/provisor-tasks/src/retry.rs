//! Exponential backoff for retryable task failures.
//!
//! `delay(n) = 0` for `n = 0`, otherwise `min(base * 2^min(n, max_exponent), ceiling)`.

use std::time::Duration;

/// Retry budget and backoff curve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay unit multiplied by the power of two.
    pub base: Duration,
    /// Upper bound on any delay.
    pub ceiling: Duration,
    /// Exponent at which growth stops.
    pub max_exponent: u32,
    /// Retries allowed before a task is marked dead.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            ceiling: Duration::from_secs(600),
            max_exponent: 10,
            max_retries: 25,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the default curve and the given budget.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Sets the delay unit and ceiling.
    #[must_use]
    pub fn with_delays(mut self, base: Duration, ceiling: Duration) -> Self {
        self.base = base;
        self.ceiling = ceiling;
        self
    }

    /// Delay before the retry that follows `retry_count` earlier retries.
    #[must_use]
    pub fn delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = retry_count.min(self.max_exponent);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.ceiling)
    }

    /// Whether a task that has already been retried `retry_count` times may
    /// be retried again.
    #[must_use]
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

impl From<&provisor_config::WorkerSection> for RetryPolicy {
    fn from(section: &provisor_config::WorkerSection) -> Self {
        Self {
            base: section.backoff_base(),
            ceiling: section.backoff_ceiling(),
            max_exponent: section.backoff_max_exponent,
            max_retries: section.max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_curve() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(9), Duration::from_secs(512));
        // 2^10 s exceeds the ten minute ceiling.
        assert_eq!(policy.delay(10), Duration::from_secs(600));
    }

    #[test]
    fn test_monotone_and_bounded() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for n in 0..=20 {
            let delay = policy.delay(n);
            assert!(delay >= previous, "delay({n}) decreased");
            assert!(delay <= Duration::from_secs(600), "delay({n}) above ceiling");
            previous = delay;
        }
    }

    #[test]
    fn test_extreme_inputs_saturate() {
        let policy = RetryPolicy {
            base: Duration::MAX,
            ceiling: Duration::MAX,
            max_exponent: 64,
            max_retries: 1,
        };
        assert_eq!(policy.delay(u32::MAX), Duration::MAX);
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::with_max_retries(2);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::with_max_retries(0).should_retry(0));
    }

    #[test]
    fn test_from_worker_section() {
        let section = provisor_config::WorkerSection {
            max_retries: 4,
            backoff_base_ms: 250,
            backoff_ceiling_secs: 3,
            backoff_max_exponent: 5,
            ..provisor_config::WorkerSection::default()
        };
        let policy = RetryPolicy::from(&section);

        assert_eq!(policy.base, Duration::from_millis(250));
        assert_eq!(policy.ceiling, Duration::from_secs(3));
        assert_eq!(policy.max_exponent, 5);
        assert_eq!(policy.max_retries, 4);
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(4), Duration::from_secs(3));
    }

    #[test]
    fn test_defaults_match_worker_section_defaults() {
        let section = provisor_config::WorkerSection::default();
        assert_eq!(RetryPolicy::from(&section), RetryPolicy::default());
    }
}

//! Retry policy for registry and pull call sites.
//!
//! The policy is a plain value: it computes delays and decides whether
//! another attempt is allowed, but never sleeps. The async driver that
//! actually waits lives next to the I/O it wraps.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::MirrorError;

/// Exponential backoff with a cap and optional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Jitter factor in `[0, 1]`; 0.25 spreads delays by ±25%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// A policy with zero delays, for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Whether a failed `attempt` (1-based) may be followed by another.
    pub fn should_retry(&self, attempt: u32, error: &MirrorError) -> bool {
        attempt < self.max_attempts && error.is_transient()
    }

    /// Delay to wait after failed `attempt` (1-based).
    ///
    /// `hint` is a server-provided wait (`Retry-After`) that replaces the
    /// computed backoff. `roll` is a uniform sample in `[0, 1)` used for
    /// jitter; pass 0.5 for no spread.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>, roll: f64) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_delay);
        }

        let exponent = attempt.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter == 0.0 {
            return backoff;
        }
        let factor = 1.0 + self.jitter * (2.0 * roll.clamp(0.0, 1.0) - 1.0);
        backoff.mul_f64(factor.max(0.0)).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> MirrorError {
        MirrorError::RegistryUnreachable {
            repository: "library/redis".to_string(),
            message: "timed out".to_string(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let p = policy();
        assert_eq!(p.delay_for(1, None, 0.5), Duration::from_millis(100));
        assert_eq!(p.delay_for(2, None, 0.5), Duration::from_millis(200));
        assert_eq!(p.delay_for(3, None, 0.5), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = policy();
        assert_eq!(p.delay_for(4, None, 0.5), Duration::from_millis(500));
        assert_eq!(p.delay_for(40, None, 0.5), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_after_hint_wins() {
        let p = policy();
        assert_eq!(
            p.delay_for(1, Some(Duration::from_millis(300)), 0.5),
            Duration::from_millis(300)
        );
        assert_eq!(
            p.delay_for(1, Some(Duration::from_secs(60)), 0.5),
            Duration::from_millis(500),
            "hint is still capped"
        );
    }

    #[test]
    fn test_jitter_spread() {
        let p = RetryPolicy {
            jitter: 0.5,
            max_delay: Duration::from_secs(10),
            ..policy()
        };
        let low = p.delay_for(1, None, 0.0);
        let mid = p.delay_for(1, None, 0.5);
        let high = p.delay_for(1, None, 0.999);
        assert!(low >= Duration::from_millis(49) && low <= Duration::from_millis(51));
        assert!(mid >= Duration::from_millis(99) && mid <= Duration::from_millis(101));
        assert!(high > mid && high <= Duration::from_millis(150));
    }

    #[test]
    fn test_should_retry_respects_attempts() {
        let p = policy();
        assert!(p.should_retry(1, &transient()));
        assert!(p.should_retry(3, &transient()));
        assert!(!p.should_retry(4, &transient()));
    }

    #[test]
    fn test_should_not_retry_permanent() {
        let p = policy();
        let not_found = MirrorError::RegistryError {
            repository: "library/redis".to_string(),
            status: 404,
            message: "not found".to_string(),
        };
        assert!(!p.should_retry(1, &not_found));
    }

    #[test]
    fn test_from_config_clamps() {
        let p = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 0,
            base_delay_ms: 2000,
            max_delay_ms: 10,
            jitter: 3.0,
        });
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.max_delay, Duration::from_millis(2000));
        assert_eq!(p.jitter, 1.0);
    }

    #[test]
    fn test_no_retry_policy() {
        let p = RetryPolicy::no_retry();
        assert!(!p.should_retry(1, &transient()));
    }
}

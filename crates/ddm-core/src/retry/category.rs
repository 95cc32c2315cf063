//! Per-category retry policy table (§4.3).
//!
//! `RetryPolicy` in `policy.rs` is the original flat exponential backoff used
//! by the plain-HTTP segment downloader. `CategoryPolicy` generalizes it: each
//! `ErrorCategory` gets its own backoff strategy, attempt budget and delay
//! bounds, and the computed delay is jittered to avoid thundering-herd
//! retries against the same host.

use std::time::Duration;

use rand::Rng;

use crate::error::{stricter_max_retries, ErrorCategory};
use crate::retry::policy::RetryDecision;

/// Backoff shape for a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
    /// Never retry regardless of attempt count.
    None,
}

/// Policy bound to one `ErrorCategory`.
#[derive(Debug, Clone, Copy)]
pub struct CategoryPolicy {
    pub strategy: BackoffStrategy,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl CategoryPolicy {
    /// Delay for `attempt` (1-based) before jitter, per `strategy`.
    fn raw_delay(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => {
                let factor = attempt.max(1);
                (self.base_delay * factor).min(self.max_delay)
            }
            BackoffStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(8);
                let factor = 1u32 << shift;
                self.base_delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }

    /// Decide whether to retry, applying jitter in `[0, delay * jitter_fraction]`.
    ///
    /// `max_retries_hint` comes from `ClassifiedError::max_retries_hint`; the
    /// engine enforces the stricter of the policy's own budget and the hint.
    pub fn decide(
        &self,
        attempt: u32,
        jitter_fraction: f64,
        max_retries_hint: Option<u32>,
    ) -> RetryDecision {
        let budget = stricter_max_retries(self.max_attempts, max_retries_hint);
        if self.strategy == BackoffStrategy::None || attempt >= budget {
            return RetryDecision::NoRetry;
        }
        let delay = self.raw_delay(attempt);
        let jittered = apply_jitter(delay, jitter_fraction);
        RetryDecision::RetryAfter(jittered)
    }
}

fn apply_jitter(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 || delay.is_zero() {
        return delay;
    }
    let max_extra = delay.mul_f64(fraction.max(0.0));
    if max_extra.is_zero() {
        return delay;
    }
    let extra_nanos = rand::thread_rng().gen_range(0..=max_extra.as_nanos().max(1));
    delay + Duration::from_nanos(extra_nanos.min(u64::MAX as u128) as u64)
}

/// The fixed default policy for a category, before any config override.
/// Matches the per-category table exactly (strategy/max retries/base delay/cap).
pub fn default_policy(category: ErrorCategory) -> CategoryPolicy {
    match category {
        ErrorCategory::Network => CategoryPolicy {
            strategy: BackoffStrategy::Exponential,
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        },
        ErrorCategory::Filesystem => CategoryPolicy {
            strategy: BackoffStrategy::Linear,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        },
        ErrorCategory::Authentication => CategoryPolicy {
            strategy: BackoffStrategy::None,
            max_attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        ErrorCategory::Validation => CategoryPolicy {
            strategy: BackoffStrategy::None,
            max_attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        ErrorCategory::Resource => CategoryPolicy {
            strategy: BackoffStrategy::Linear,
            max_attempts: 2,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(15),
        },
        ErrorCategory::Encryption => CategoryPolicy {
            strategy: BackoffStrategy::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        },
        ErrorCategory::Parsing => CategoryPolicy {
            strategy: BackoffStrategy::Fixed,
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(500),
        },
        ErrorCategory::System => CategoryPolicy {
            strategy: BackoffStrategy::None,
            max_attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
    }
}

/// The full table, indexed by category.
#[derive(Debug, Clone, Copy)]
pub struct CategoryPolicyTable {
    pub jitter_fraction: f64,
}

impl Default for CategoryPolicyTable {
    fn default() -> Self {
        Self { jitter_fraction: 0.1 }
    }
}

impl CategoryPolicyTable {
    pub fn with_jitter_fraction(jitter_fraction: f64) -> Self {
        Self { jitter_fraction }
    }

    pub fn policy_for(&self, category: ErrorCategory) -> CategoryPolicy {
        default_policy(category)
    }

    pub fn decide(
        &self,
        category: ErrorCategory,
        attempt: u32,
        max_retries_hint: Option<u32>,
    ) -> RetryDecision {
        self.policy_for(category)
            .decide(attempt, self.jitter_fraction, max_retries_hint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_never_retries() {
        let table = CategoryPolicyTable::default();
        assert_eq!(
            table.decide(ErrorCategory::Authentication, 1, None),
            RetryDecision::NoRetry
        );
    }

    #[test]
    fn network_backs_off_exponentially_with_jitter() {
        let table = CategoryPolicyTable::with_jitter_fraction(0.0);
        let RetryDecision::RetryAfter(d1) = table.decide(ErrorCategory::Network, 1, None) else {
            panic!("expected retry");
        };
        let RetryDecision::RetryAfter(d2) = table.decide(ErrorCategory::Network, 2, None) else {
            panic!("expected retry");
        };
        assert!(d2 >= d1);
    }

    #[test]
    fn stricter_hint_shortens_budget() {
        let table = CategoryPolicyTable::default();
        // Network default budget is 5 attempts; a hint of 1 should cut it off immediately.
        assert_eq!(
            table.decide(ErrorCategory::Network, 1, Some(1)),
            RetryDecision::NoRetry
        );
    }

    #[test]
    fn jitter_never_reduces_delay() {
        let table = CategoryPolicyTable::with_jitter_fraction(0.5);
        let RetryDecision::RetryAfter(d) = table.decide(ErrorCategory::Resource, 1, None) else {
            panic!("expected retry");
        };
        assert!(d >= Duration::from_secs(1));
    }
}

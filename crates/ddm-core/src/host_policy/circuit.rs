//! Per-host circuit breaker (§4.6), living alongside the rest of the host
//! policy cache and keyed by the same `HostKey`.
//!
//! Failures and successes are classified by `ErrorCategory` (the same
//! taxonomy the retry engine uses) so a host tripping on encryption failures
//! doesn't also suppress unrelated network traffic to the same host, and
//! vice versa: each `(HostKey, ErrorCategory)` pair gets its own breaker.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;

use super::HostKey;

/// Breaker state (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-category thresholds. See `defaults_for` for the fixed table.
#[derive(Debug, Clone, Copy)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub monitoring_window: Duration,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

pub fn defaults_for(category: ErrorCategory) -> CircuitConfig {
    match category {
        ErrorCategory::Network => CircuitConfig {
            failure_threshold: 3,
            monitoring_window: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        },
        ErrorCategory::Filesystem => CircuitConfig {
            failure_threshold: 5,
            monitoring_window: Duration::from_secs(10),
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 1,
        },
        ErrorCategory::Encryption => CircuitConfig {
            failure_threshold: 2,
            monitoring_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 1,
        },
        _ => CircuitConfig {
            failure_threshold: 5,
            monitoring_window: Duration::from_secs(300),
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
        },
    }
}

#[derive(Debug, Clone)]
struct Breaker {
    state: CircuitState,
    config: CircuitConfig,
    /// Failure timestamps within the rolling monitoring window.
    failures: Vec<Instant>,
    /// Consecutive successes observed while `HalfOpen`.
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new(config: CircuitConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            config,
            failures: Vec::new(),
            half_open_successes: 0,
            opened_at: None,
        }
    }

    fn prune(&mut self, now: Instant) {
        let window = self.config.monitoring_window;
        self.failures.retain(|t| now.duration_since(*t) <= window);
    }

    fn record_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::HalfOpen => {
                self.trip(now);
            }
            CircuitState::Closed => {
                self.prune(now);
                self.failures.push(now);
                if self.failures.len() as u32 >= self.config.failure_threshold {
                    self.trip(now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_successes = 0;
        self.failures.clear();
    }

    fn record_success(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.failures.clear();
            }
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.success_threshold {
                    self.state = CircuitState::Closed;
                    self.half_open_successes = 0;
                    self.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Refresh `Open -> HalfOpen` once the recovery timeout has elapsed, then
    /// report whether a request may currently proceed.
    fn allow_request(&mut self, now: Instant) -> bool {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if now.duration_since(opened_at) >= self.config.recovery_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                }
            }
        }
        !matches!(self.state, CircuitState::Open)
    }
}

/// Breaker cache, keyed by `(HostKey, ErrorCategory)`.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: HashMap<(HostKey, ErrorCategory), Breaker>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, key: &HostKey, category: ErrorCategory) -> &mut Breaker {
        self.breakers
            .entry((key.clone(), category))
            .or_insert_with(|| Breaker::new(defaults_for(category)))
    }

    /// Whether a request to `key` for `category` may proceed right now.
    pub fn allow_request(&mut self, key: &HostKey, category: ErrorCategory) -> bool {
        self.entry(key, category).allow_request(Instant::now())
    }

    pub fn record_failure(&mut self, key: &HostKey, category: ErrorCategory) {
        self.entry(key, category).record_failure(Instant::now());
    }

    pub fn record_success(&mut self, key: &HostKey, category: ErrorCategory) {
        self.entry(key, category).record_success(Instant::now());
    }

    pub fn state(&self, key: &HostKey, category: ErrorCategory) -> CircuitState {
        self.breakers
            .get(&(key.clone(), category))
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Serializable snapshot for persistence under the XDG state dir,
    /// matching the rest of `host_policy`'s JSON-snapshot idiom.
    pub fn to_snapshot(&self) -> CircuitBreakerSnapshot {
        let entries = self
            .breakers
            .iter()
            .map(|((key, category), breaker)| PersistedBreaker {
                scheme: key.scheme.clone(),
                host: key.host.clone(),
                port: key.port,
                category: format!("{category}"),
                state: breaker.state,
            })
            .collect();
        CircuitBreakerSnapshot { version: 1, entries }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedBreaker {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub category: String,
    pub state: CircuitState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub version: u8,
    pub entries: Vec<PersistedBreaker>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(host: &str) -> HostKey {
        HostKey {
            scheme: "https".into(),
            host: host.into(),
            port: 443,
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let mut reg = CircuitBreakerRegistry::new();
        let k = key("a.example.com");
        for _ in 0..3 {
            reg.record_failure(&k, ErrorCategory::Network);
        }
        assert_eq!(reg.state(&k, ErrorCategory::Network), CircuitState::Open);
        assert!(!reg.allow_request(&k, ErrorCategory::Network));
    }

    #[test]
    fn categories_are_independent() {
        let mut reg = CircuitBreakerRegistry::new();
        let k = key("b.example.com");
        for _ in 0..3 {
            reg.record_failure(&k, ErrorCategory::Network);
        }
        assert!(reg.allow_request(&k, ErrorCategory::Encryption));
    }

    #[test]
    fn half_open_recovers_after_success_threshold() {
        let mut reg = CircuitBreakerRegistry::new();
        let k = key("c.example.com");
        {
            let b = reg.entry(&k, ErrorCategory::Filesystem);
            b.trip(Instant::now() - Duration::from_secs(70));
        }
        assert!(reg.allow_request(&k, ErrorCategory::Filesystem));
        assert_eq!(
            reg.state(&k, ErrorCategory::Filesystem),
            CircuitState::HalfOpen
        );
        reg.record_success(&k, ErrorCategory::Filesystem);
        assert_eq!(
            reg.state(&k, ErrorCategory::Filesystem),
            CircuitState::Closed
        );
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let mut reg = CircuitBreakerRegistry::new();
        let k = key("d.example.com");
        {
            let b = reg.entry(&k, ErrorCategory::Network);
            b.trip(Instant::now() - Duration::from_secs(60));
        }
        assert!(reg.allow_request(&k, ErrorCategory::Network));
        reg.record_failure(&k, ErrorCategory::Network);
        assert_eq!(reg.state(&k, ErrorCategory::Network), CircuitState::Open);
    }
}

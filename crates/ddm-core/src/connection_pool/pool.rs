//! Per-host connection pool (§4.2).
//!
//! `curl::easy::Easy` handles are not natively pooled the way `reqwest::Client`
//! handles are, so this models a pool of *permits* rather than live sockets:
//! a lease bounds per-host and global concurrency and tracks idle/health
//! state, while the actual TCP/TLS reuse is left to curl's own connection
//! cache inside each blocking call. This generalizes
//! `scheduler::budget::GlobalConnectionBudget` (global cap, atomic
//! compare-exchange reserve/release) to a per-host cap keyed the same way
//! `host_policy::HostKey` keys its cache.
//!
//! §4.2/§5: "Otherwise, the caller blocks on a per-host semaphore until a
//! handle returns." `checkout` is therefore `async` and awaits a
//! `tokio::sync::Semaphore` sized to `max_connections_per_host` per host,
//! plus the same blocking discipline against the global budget, instead of
//! failing a healthy caller with `Exhaustion` the moment every slot is busy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::error::{DomainError, ErrorCategory};
use crate::host_policy::HostKey;
use crate::scheduler::budget::GlobalConnectionBudget;

use super::lease::ConnectionLease;

/// Backoff between polls of the global budget while a per-host permit is
/// already held. The per-host semaphore handles the common case (one host
/// at its own cap); this only matters when the *global* cap across all
/// hosts is the binding constraint.
const GLOBAL_BUDGET_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy)]
pub struct ConnectionPoolConfig {
    pub max_connections_per_host: usize,
    pub max_idle_per_host: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub keep_alive_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: 5,
            max_idle_per_host: 5,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            keep_alive_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct HostPoolState {
    in_use: usize,
    idle: usize,
    last_probe_at: Option<Instant>,
    healthy: bool,
    successes: u64,
    failures: u64,
}

/// Per-host, globally-budgeted connection pool.
pub struct ConnectionPool {
    config: ConnectionPoolConfig,
    global_budget: GlobalConnectionBudget,
    hosts: Mutex<HashMap<HostKey, HostPoolState>>,
    /// One semaphore per host, sized to `max_connections_per_host`. This is
    /// the "caller blocks ... until a handle returns" mechanism of §4.2/§5:
    /// acquiring a permit suspends the caller instead of failing it.
    semaphores: Mutex<HashMap<HostKey, Arc<Semaphore>>>,
    total_checkouts: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(max_total_connections: usize, config: ConnectionPoolConfig) -> Self {
        Self {
            config,
            global_budget: GlobalConnectionBudget::new(max_total_connections),
            hosts: Mutex::new(HashMap::new()),
            semaphores: Mutex::new(HashMap::new()),
            total_checkouts: AtomicUsize::new(0),
        }
    }

    fn host_semaphore(&self, host: &HostKey) -> Arc<Semaphore> {
        self.semaphores
            .lock()
            .unwrap()
            .entry(host.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_connections_per_host.max(1))))
            .clone()
    }

    /// Acquire a lease for `host`, blocking (awaiting) until both the
    /// per-host limit and the global budget have a free slot (§4.2: "the
    /// caller blocks on a per-host semaphore until a handle returns"; §5:
    /// "semaphore per host gating concurrent handle acquisition"). Never
    /// fails a healthy caller on capacity alone — only the semaphore itself
    /// being closed (never done in this pool's lifetime) would error.
    pub async fn checkout(&self, host: HostKey) -> Result<ConnectionLease<'_>, DomainError> {
        let semaphore = self.host_semaphore(&host);
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| DomainError::SystemGeneric("connection pool semaphore closed".to_string()))?;

        loop {
            let reserved = self.global_budget.reserve(1);
            if reserved > 0 {
                break;
            }
            tokio::time::sleep(GLOBAL_BUDGET_POLL_INTERVAL).await;
        }

        {
            let mut hosts = self.hosts.lock().unwrap();
            let state = hosts.entry(host.clone()).or_insert_with(|| HostPoolState {
                healthy: true,
                ..HostPoolState::default()
            });
            if state.idle > 0 {
                state.idle -= 1;
            }
            state.in_use += 1;
        }

        self.total_checkouts.fetch_add(1, Ordering::Relaxed);
        Ok(ConnectionLease::new(self, host, permit))
    }

    pub fn total_budget(&self) -> usize {
        self.global_budget.available() + self.global_budget.in_use()
    }

    pub fn config(&self) -> ConnectionPoolConfig {
        self.config
    }

    /// Called by `ConnectionLease::drop`: release the host slot back to idle
    /// (bounded by `max_idle_per_host`) and release the global budget slot.
    pub(super) fn return_connection(&self, host: &HostKey, healthy: bool) {
        let mut hosts = self.hosts.lock().unwrap();
        if let Some(state) = hosts.get_mut(host) {
            state.in_use = state.in_use.saturating_sub(1);
            if healthy {
                state.successes += 1;
                if state.idle < self.config.max_idle_per_host {
                    state.idle += 1;
                }
            } else {
                state.failures += 1;
            }
        }
        drop(hosts);
        self.global_budget.release(1);
    }

    /// Whether `host` is currently considered healthy (defaults to true for
    /// a host with no history).
    pub fn is_healthy(&self, host: &HostKey) -> bool {
        self.hosts.lock().unwrap().get(host).map(|s| s.healthy).unwrap_or(true)
    }

    /// Run (or skip, if still within `health_check_interval`) a health probe
    /// for `host` using the supplied predicate, and record the result.
    pub fn probe_health<F>(&self, host: &HostKey, probe: F)
    where
        F: FnOnce() -> bool,
    {
        let now = Instant::now();
        let should_probe = {
            let hosts = self.hosts.lock().unwrap();
            hosts
                .get(host)
                .and_then(|s| s.last_probe_at)
                .map(|at| now.duration_since(at) >= self.config.health_check_interval)
                .unwrap_or(true)
        };
        if !should_probe {
            return;
        }
        let healthy = probe();
        let mut hosts = self.hosts.lock().unwrap();
        let state = hosts.entry(host.clone()).or_insert_with(HostPoolState::default);
        state.healthy = healthy;
        state.last_probe_at = Some(now);
    }

    pub fn stats(&self, host: &HostKey) -> (u64, u64) {
        self.hosts
            .lock()
            .unwrap()
            .get(host)
            .map(|s| (s.successes, s.failures))
            .unwrap_or((0, 0))
    }

    /// Restrict automatic transport-level retries to idempotent methods and
    /// the retryable HTTP status class (§4.2/§4.3): GET/HEAD plus
    /// {429,500,502,503,504}.
    pub fn is_automatically_retryable(method: &str, status: Option<u16>) -> bool {
        let idempotent = matches!(method.to_ascii_uppercase().as_str(), "GET" | "HEAD");
        if !idempotent {
            return false;
        }
        match status {
            None => true,
            Some(s) => matches!(s, 429 | 500 | 502 | 503 | 504),
        }
    }

    pub const NETWORK_CATEGORY: ErrorCategory = ErrorCategory::Network;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str) -> HostKey {
        HostKey {
            scheme: "https".into(),
            host: name.into(),
            port: 443,
        }
    }

    #[tokio::test]
    async fn checkout_and_return_updates_counters() {
        let pool = ConnectionPool::new(10, ConnectionPoolConfig::default());
        let h = host("a.example.com");
        let lease = pool.checkout(h.clone()).await.unwrap();
        assert_eq!(pool.global_budget.in_use(), 1);
        drop(lease);
        assert_eq!(pool.global_budget.in_use(), 0);
        assert_eq!(pool.stats(&h), (1, 0));
    }

    /// §4.2/§5: once a host is at its configured cap, the *next* checkout
    /// must block (not fail) until a handle is released.
    #[tokio::test]
    async fn per_host_limit_blocks_the_caller_until_release() {
        let mut cfg = ConnectionPoolConfig::default();
        cfg.max_connections_per_host = 1;
        let pool = Arc::new(ConnectionPool::new(10, cfg));
        let h = host("b.example.com");
        let lease = pool.checkout(h.clone()).await.unwrap();

        // A second checkout for the same host must not resolve while the
        // first lease is held.
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.checkout(h.clone())).await;
        assert!(blocked.is_err(), "checkout should have blocked, not errored or succeeded early");

        drop(lease);
        let second = tokio::time::timeout(Duration::from_millis(200), pool.checkout(h)).await;
        assert!(second.is_ok(), "checkout should unblock once the prior lease is released");
        assert!(second.unwrap().is_ok());
    }

    /// Same blocking discipline applies to the global budget across hosts,
    /// not just the per-host cap.
    #[tokio::test]
    async fn global_budget_blocks_the_caller_across_hosts() {
        let pool = Arc::new(ConnectionPool::new(1, ConnectionPoolConfig::default()));
        let lease = pool.checkout(host("c.example.com")).await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), pool.checkout(host("d.example.com"))).await;
        assert!(blocked.is_err(), "checkout should have blocked on the global budget");

        drop(lease);
        let second =
            tokio::time::timeout(Duration::from_millis(200), pool.checkout(host("d.example.com"))).await;
        assert!(second.is_ok());
        assert!(second.unwrap().is_ok());
    }

    #[test]
    fn automatic_retry_restricted_to_idempotent_and_retryable_status() {
        assert!(ConnectionPool::is_automatically_retryable("GET", Some(503)));
        assert!(!ConnectionPool::is_automatically_retryable("POST", Some(503)));
        assert!(!ConnectionPool::is_automatically_retryable("GET", Some(404)));
        assert!(ConnectionPool::is_automatically_retryable("HEAD", None));
    }
}

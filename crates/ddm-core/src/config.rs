use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration loaded from `~/.config/ddm/config.toml`.
///
/// Every field has a `#[serde(default = ...)]` so config files written by an
/// older version of `ddm` keep loading as new tunables are added.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdmConfig {
    /// Maximum total concurrent HTTP connections across all jobs.
    #[serde(default = "default_max_total_connections")]
    pub max_total_connections: usize,
    /// Maximum concurrent HTTP connections per host.
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,
    /// Minimum number of segments per job.
    #[serde(default = "default_min_segments")]
    pub min_segments: usize,
    /// Maximum number of segments per job.
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,

    /// Connection pool tuning, keyed per host (§4.2).
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
    /// Per-category retry tuning (§4.3).
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per-category circuit breaker tuning (§4.6).
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Queue scheduler admission control (§4.7).
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Prioritization factor weights (§4.7).
    #[serde(default)]
    pub prioritization: PrioritizationConfig,
    /// ETA sampling (§4.8).
    #[serde(default)]
    pub eta: EtaConfig,
    /// Bandwidth sampling (§4.9).
    #[serde(default)]
    pub bandwidth: BandwidthConfig,
    /// Batch aggregation (§4.10).
    #[serde(default)]
    pub batch: BatchConfig,
}

fn default_max_total_connections() -> usize {
    64
}
fn default_max_connections_per_host() -> usize {
    16
}
fn default_min_segments() -> usize {
    4
}
fn default_max_segments() -> usize {
    16
}

impl Default for DdmConfig {
    fn default() -> Self {
        Self {
            max_total_connections: default_max_total_connections(),
            max_connections_per_host: default_max_connections_per_host(),
            min_segments: default_min_segments(),
            max_segments: default_max_segments(),
            connection_pool: ConnectionPoolConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            scheduler: SchedulerConfig::default(),
            prioritization: PrioritizationConfig::default(),
            eta: EtaConfig::default(),
            bandwidth: BandwidthConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

/// §4.2 ConnectionPool defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    pub max_connections_per_host: usize,
    pub max_idle_per_host: usize,
    pub connect_timeout: DurationSecs,
    pub read_timeout: DurationSecs,
    pub keep_alive_timeout: DurationSecs,
    pub health_check_interval: DurationSecs,
    pub transport_retry_budget: u32,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: 5,
            max_idle_per_host: 5,
            connect_timeout: DurationSecs::secs(30),
            read_timeout: DurationSecs::secs(60),
            keep_alive_timeout: DurationSecs::secs(300),
            health_check_interval: DurationSecs::secs(60),
            transport_retry_budget: 3,
        }
    }
}

/// §4.3 RetryEngine: per-category policy table. See `retry::category` for the
/// fixed defaults that mirror this table; this struct allows overriding them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Jitter fraction applied to every computed delay (uniform in [0, delay*fraction]).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { jitter_fraction: 0.1 }
    }
}

/// §4.6 CircuitBreaker defaults (overridable per category at the process level).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub default_failure_threshold: u32,
    pub default_monitoring_window: DurationSecs,
    pub default_recovery_timeout: DurationSecs,
    pub default_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            default_failure_threshold: 5,
            default_monitoring_window: DurationSecs::secs(300),
            default_recovery_timeout: DurationSecs::secs(60),
            default_success_threshold: 3,
        }
    }
}

/// §4.7 QueueScheduler admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent_tasks: usize,
    pub tick_interval: DurationSecs,
    pub per_task_parallelism: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            tick_interval: DurationSecs::secs(5),
            per_task_parallelism: 4,
        }
    }
}

/// §4.7 PrioritizationEngine factor weights. Must sum to 1 (validated/renormalized
/// on load by `prioritize::engine::PrioritizationEngine::new`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrioritizationConfig {
    pub weight_file_size: f64,
    pub weight_user_preference: f64,
    pub weight_system_resources: f64,
    pub weight_historical_performance: f64,
    pub weight_time_sensitivity: f64,
    pub weight_dependency_chain: f64,
    pub weight_bandwidth_efficiency: f64,
    pub weight_completion_probability: f64,
    pub adaptive_learning: bool,
}

impl Default for PrioritizationConfig {
    fn default() -> Self {
        Self {
            weight_file_size: 0.20,
            weight_user_preference: 0.30,
            weight_system_resources: 0.15,
            weight_historical_performance: 0.10,
            weight_time_sensitivity: 0.10,
            weight_dependency_chain: 0.05,
            weight_bandwidth_efficiency: 0.05,
            weight_completion_probability: 0.05,
            adaptive_learning: true,
        }
    }
}

/// §4.8 ETACalculator sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtaConfig {
    pub ring_capacity: usize,
}

impl Default for EtaConfig {
    fn default() -> Self {
        Self { ring_capacity: 100 }
    }
}

/// §4.9 BandwidthMonitor sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    pub sample_interval: DurationSecs,
    pub ring_capacity: usize,
    pub hint_interval: DurationSecs,
    pub theoretical_max_bps: f64,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            sample_interval: DurationSecs::secs(1),
            ring_capacity: 3600,
            hint_interval: DurationSecs::secs(30),
            // 100 Mb/s expressed in bytes/sec.
            theoretical_max_bps: 100_000_000.0 / 8.0,
        }
    }
}

/// §4.10 BatchAggregator GC interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub stale_after: DurationSecs,
    pub gc_interval: DurationSecs,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            stale_after: DurationSecs::secs(30),
            gc_interval: DurationSecs::secs(300),
        }
    }
}

/// A `Duration` that (de)serializes as whole seconds in TOML, since `Duration`
/// itself has no stable serde representation we want to expose to users.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationSecs(u64);

impl DurationSecs {
    pub const fn secs(secs: u64) -> Self {
        DurationSecs(secs)
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl From<DurationSecs> for Duration {
    fn from(d: DurationSecs) -> Duration {
        d.as_duration()
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("ddm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<DdmConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = DdmConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: DdmConfig = toml::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = DdmConfig::default();
        assert_eq!(cfg.max_total_connections, 64);
        assert_eq!(cfg.max_connections_per_host, 16);
        assert_eq!(cfg.min_segments, 4);
        assert_eq!(cfg.max_segments, 16);
        assert_eq!(cfg.scheduler.max_concurrent_tasks, 3);
        assert_eq!(cfg.circuit_breaker.default_failure_threshold, 5);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = DdmConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: DdmConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.max_total_connections, cfg.max_total_connections);
        assert_eq!(parsed.max_connections_per_host, cfg.max_connections_per_host);
        assert_eq!(parsed.min_segments, cfg.min_segments);
        assert_eq!(parsed.max_segments, cfg.max_segments);
        assert_eq!(
            parsed.prioritization.weight_user_preference,
            cfg.prioritization.weight_user_preference
        );
    }

    #[test]
    fn config_toml_custom_values() {
        let toml = r#"
            max_total_connections = 8
            max_connections_per_host = 4
            min_segments = 2
            max_segments = 32
        "#;
        let cfg: DdmConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.max_total_connections, 8);
        assert_eq!(cfg.max_connections_per_host, 4);
        assert_eq!(cfg.min_segments, 2);
        assert_eq!(cfg.max_segments, 32);
        // Fields absent from the TOML fall back to their defaults.
        assert_eq!(cfg.scheduler.max_concurrent_tasks, 3);
        assert_eq!(cfg.eta.ring_capacity, 100);
    }

    #[test]
    fn prioritization_weights_sum_to_one() {
        let p = PrioritizationConfig::default();
        let sum = p.weight_file_size
            + p.weight_user_preference
            + p.weight_system_resources
            + p.weight_historical_performance
            + p.weight_time_sensitivity
            + p.weight_dependency_chain
            + p.weight_bandwidth_efficiency
            + p.weight_completion_probability;
        assert!((sum - 1.0).abs() < 1e-9);
    }
}

//! `BandwidthMonitor` (§4.9): samples the primary network interface once per
//! `sample_interval`, keeps a bounded ring of samples, and derives
//! optimization hints every `hint_interval`.
//!
//! Counter reads are abstracted behind `InterfaceCounterSource` so the
//! sampling loop can be driven by a fake source in tests instead of
//! `/proc/net/dev`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::BandwidthConfig;

/// Cumulative byte/connection counters for one network interface at a point
/// in time.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Where `BandwidthMonitor` reads interface counters from. Implemented for
/// `/proc/net/dev` on Linux; swappable in tests.
pub trait InterfaceCounterSource: Send {
    /// Returns `(interface_name, counters)` for every interface currently
    /// visible to the source.
    fn read_all(&mut self) -> std::io::Result<Vec<(String, InterfaceCounters)>>;

    /// Number of sockets in the `ESTABLISHED` state, across all interfaces.
    fn established_connections(&mut self) -> std::io::Result<u32>;
}

/// Reads `/proc/net/dev` and `/proc/net/tcp`/`tcp6`, as Linux/Debian targets.
#[derive(Default)]
pub struct ProcNetSource;

impl InterfaceCounterSource for ProcNetSource {
    fn read_all(&mut self) -> std::io::Result<Vec<(String, InterfaceCounters)>> {
        let text = std::fs::read_to_string("/proc/net/dev")?;
        let mut out = Vec::new();
        for line in text.lines().skip(2) {
            let Some((name, rest)) = line.split_once(':') else {
                continue;
            };
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() < 9 {
                continue;
            }
            let rx_bytes = fields[0].parse().unwrap_or(0);
            let tx_bytes = fields[8].parse().unwrap_or(0);
            out.push((
                name.trim().to_string(),
                InterfaceCounters { rx_bytes, tx_bytes },
            ));
        }
        Ok(out)
    }

    fn established_connections(&mut self) -> std::io::Result<u32> {
        const TCP_ESTABLISHED: &str = "01";
        let mut count = 0u32;
        for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
            let Ok(text) = std::fs::read_to_string(path) else {
                continue;
            };
            for line in text.lines().skip(1) {
                let mut fields = line.split_whitespace();
                // sl, local_address, rem_address, st, ...
                if let Some(st) = fields.nth(3) {
                    if st.eq_ignore_ascii_case(TCP_ESTABLISHED) {
                        count += 1;
                    }
                }
            }
        }
        Ok(count)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BandwidthSample {
    pub at: Instant,
    pub download_bps: f64,
    pub upload_bps: f64,
    pub connection_count: u32,
}

/// An optimization hint published every `hint_interval` (§4.9's thresholds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationHint {
    IncreaseConcurrency,
    ReduceConcurrency,
    OptimizeNetwork,
    EnableBandwidthLimiting,
}

/// Samples one network interface over time and derives utilization stats
/// and optimization hints from the accumulated ring.
pub struct BandwidthMonitor {
    config: BandwidthConfig,
    source: Box<dyn InterfaceCounterSource>,
    primary_interface: Option<String>,
    last_counters: Option<InterfaceCounters>,
    last_sample_at: Option<Instant>,
    samples: VecDeque<BandwidthSample>,
}

impl BandwidthMonitor {
    pub fn new(config: BandwidthConfig) -> Self {
        Self::with_source(config, Box::new(ProcNetSource))
    }

    pub fn with_source(config: BandwidthConfig, source: Box<dyn InterfaceCounterSource>) -> Self {
        let capacity = config.ring_capacity.max(1);
        Self {
            config,
            source,
            primary_interface: None,
            last_counters: None,
            last_sample_at: None,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Chooses the primary interface as the one with the greatest cumulative
    /// received bytes, if it has not already been chosen.
    fn ensure_primary(&mut self, interfaces: &[(String, InterfaceCounters)]) {
        if self.primary_interface.is_some() {
            return;
        }
        self.primary_interface = interfaces
            .iter()
            .max_by_key(|(_, c)| c.rx_bytes)
            .map(|(name, _)| name.clone());
    }

    /// Takes one sample. No-ops (returns `None`) on the very first call,
    /// since a rate requires two counter readings.
    pub fn sample(&mut self) -> std::io::Result<Option<BandwidthSample>> {
        let interfaces = self.source.read_all()?;
        self.ensure_primary(&interfaces);

        let Some(primary) = self.primary_interface.clone() else {
            return Ok(None);
        };
        let Some((_, counters)) = interfaces.iter().find(|(name, _)| name == &primary) else {
            return Ok(None);
        };

        let now = Instant::now();
        let connection_count = self.source.established_connections()?;

        let sample = match (self.last_counters, self.last_sample_at) {
            (Some(prev), Some(prev_at)) => {
                let dt = now.duration_since(prev_at).as_secs_f64().max(f64::EPSILON);
                let download_bps = (counters.rx_bytes.saturating_sub(prev.rx_bytes)) as f64 / dt;
                let upload_bps = (counters.tx_bytes.saturating_sub(prev.tx_bytes)) as f64 / dt;
                Some(BandwidthSample {
                    at: now,
                    download_bps,
                    upload_bps,
                    connection_count,
                })
            }
            _ => None,
        };

        self.last_counters = Some(*counters);
        self.last_sample_at = Some(now);

        if let Some(sample) = sample {
            if self.samples.len() == self.config.ring_capacity.max(1) {
                self.samples.pop_front();
            }
            self.samples.push_back(sample);
            return Ok(Some(sample));
        }
        Ok(None)
    }

    pub fn sample_interval(&self) -> Duration {
        self.config.sample_interval.as_duration()
    }

    pub fn hint_interval(&self) -> Duration {
        self.config.hint_interval.as_duration()
    }

    pub fn latest(&self) -> Option<BandwidthSample> {
        self.samples.back().copied()
    }

    /// Average download speed over the whole retained ring, or `0` if empty.
    pub fn average_download_bps(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.download_bps).sum::<f64>() / self.samples.len() as f64
    }

    fn utilization(&self) -> f64 {
        let theoretical_max = self.config.theoretical_max_bps.max(f64::EPSILON);
        let current = self.latest().map(|s| s.download_bps).unwrap_or(0.0);
        (current / theoretical_max).clamp(0.0, 1.0)
    }

    fn efficiency(&self) -> f64 {
        let theoretical_max = self.config.theoretical_max_bps.max(f64::EPSILON);
        (self.average_download_bps() / theoretical_max).clamp(0.0, 1.0)
    }

    /// Derives hints from current utilization/efficiency and the caller's
    /// count of currently-active tasks (§4.9's thresholds). Multiple hints
    /// may apply simultaneously.
    pub fn optimization_hints(&self, active_tasks: usize) -> Vec<OptimizationHint> {
        let mut hints = Vec::new();
        let utilization = self.utilization();
        let efficiency = self.efficiency();

        if utilization < 0.30 && active_tasks < 5 {
            hints.push(OptimizationHint::IncreaseConcurrency);
        }
        if utilization > 0.90 {
            hints.push(OptimizationHint::ReduceConcurrency);
        }
        if efficiency < 0.5 {
            hints.push(OptimizationHint::OptimizeNetwork);
        }
        if utilization > 0.80 && active_tasks > 3 {
            hints.push(OptimizationHint::EnableBandwidthLimiting);
        }
        hints
    }
}

/// Runs the sampling loop: takes a sample every `sample_interval`, and logs
/// the derived hints every `hint_interval`. Intended to be spawned with
/// `tokio::spawn` once per process.
pub async fn run_monitor_loop(
    mut monitor: BandwidthMonitor,
    active_tasks: std::sync::Arc<std::sync::atomic::AtomicUsize>,
) {
    let sample_interval = monitor.sample_interval();
    let hint_interval = monitor.hint_interval();
    let mut since_last_hint = Duration::ZERO;

    loop {
        tokio::time::sleep(sample_interval).await;
        if let Err(err) = monitor.sample() {
            tracing::warn!(error = %err, "bandwidth sample failed");
            continue;
        }

        since_last_hint += sample_interval;
        if since_last_hint >= hint_interval {
            since_last_hint = Duration::ZERO;
            let active = active_tasks.load(std::sync::atomic::Ordering::Relaxed);
            let hints = monitor.optimization_hints(active);
            if !hints.is_empty() {
                tracing::debug!(?hints, active_tasks = active, "bandwidth optimization hints");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake counter source that advances a fixed delta of bytes on each
    /// call to `read_all`, so tests don't depend on wall-clock timing of
    /// real interfaces.
    struct FakeSource {
        rx: u64,
        tx: u64,
        rx_step: u64,
        tx_step: u64,
        connections: u32,
    }

    impl InterfaceCounterSource for FakeSource {
        fn read_all(&mut self) -> std::io::Result<Vec<(String, InterfaceCounters)>> {
            self.rx += self.rx_step;
            self.tx += self.tx_step;
            Ok(vec![(
                "eth0".to_string(),
                InterfaceCounters {
                    rx_bytes: self.rx,
                    tx_bytes: self.tx,
                },
            )])
        }

        fn established_connections(&mut self) -> std::io::Result<u32> {
            Ok(self.connections)
        }
    }

    fn monitor_with(rx_step: u64, connections: u32) -> BandwidthMonitor {
        let cfg = BandwidthConfig {
            theoretical_max_bps: 1000.0,
            ..BandwidthConfig::default()
        };
        BandwidthMonitor::with_source(
            cfg,
            Box::new(FakeSource {
                rx: 0,
                tx: 0,
                rx_step,
                tx_step: 0,
                connections,
            }),
        )
    }

    #[test]
    fn first_sample_has_no_rate_yet() {
        let mut monitor = monitor_with(1000, 1);
        assert!(monitor.sample().unwrap().is_none());
    }

    #[test]
    fn second_sample_reports_a_positive_rate() {
        let mut monitor = monitor_with(1000, 1);
        monitor.sample().unwrap();
        let sample = monitor.sample().unwrap().unwrap();
        assert!(sample.download_bps > 0.0);
    }

    #[test]
    fn low_utilization_and_few_tasks_suggests_increasing_concurrency() {
        let mut monitor = monitor_with(10, 1);
        monitor.sample().unwrap();
        monitor.sample().unwrap();
        let hints = monitor.optimization_hints(1);
        assert!(hints.contains(&OptimizationHint::IncreaseConcurrency));
        assert!(hints.contains(&OptimizationHint::OptimizeNetwork));
    }

    #[test]
    fn high_utilization_suggests_reducing_concurrency_and_limiting() {
        // theoretical_max is 1000 bytes/sec; sampling ~1s apart with a big
        // step pushes utilization near saturation.
        let mut monitor = monitor_with(5000, 10);
        monitor.sample().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        monitor.sample().unwrap();
        let hints = monitor.optimization_hints(10);
        assert!(hints.contains(&OptimizationHint::ReduceConcurrency));
        assert!(hints.contains(&OptimizationHint::EnableBandwidthLimiting));
    }

    #[test]
    fn ring_evicts_oldest_sample_past_capacity() {
        let cfg = BandwidthConfig {
            ring_capacity: 3,
            ..BandwidthConfig::default()
        };
        let mut monitor = BandwidthMonitor::with_source(
            cfg,
            Box::new(FakeSource {
                rx: 0,
                tx: 0,
                rx_step: 100,
                tx_step: 0,
                connections: 0,
            }),
        );
        for _ in 0..6 {
            monitor.sample().unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(monitor.samples.len(), 3);
    }

    #[test]
    fn proc_net_dev_parser_reads_real_system_file() {
        // Sanity-checks the real /proc/net/dev parser shape without
        // asserting on specific interface names, which vary by host.
        let mut source = ProcNetSource;
        let result = source.read_all();
        if let Ok(interfaces) = result {
            assert!(interfaces.iter().all(|(name, _)| !name.is_empty()));
        }
    }
}

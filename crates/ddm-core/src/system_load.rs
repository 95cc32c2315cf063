//! System resource sampling for `SchedulingStrategy::ResourceAware` (§4.7).
//!
//! Grounded on `bandwidth.rs`'s `/proc/net/dev` reader: same idiom, a small
//! `/proc`-backed source behind a trait so tests can substitute a fake.

use std::collections::HashMap;

/// CPU and memory utilization as percentages in `[0, 100]`, fed straight into
/// `prioritize::queue::ResourceLoad` alongside a network percentage the
/// caller derives from `BandwidthMonitor`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLoad {
    pub cpu_pct: f64,
    pub memory_pct: f64,
}

/// Where `SystemLoadSampler` reads raw counters from. Implemented for
/// `/proc/stat` + `/proc/meminfo` on Linux; swappable in tests.
pub trait SystemStatSource: Send {
    fn read_cpu_totals(&mut self) -> std::io::Result<CpuTotals>;
    fn read_mem_pct(&mut self) -> std::io::Result<f64>;
}

/// Cumulative jiffy counters from the aggregate `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuTotals {
    pub idle: u64,
    pub total: u64,
}

#[derive(Default)]
pub struct ProcStatSource;

impl SystemStatSource for ProcStatSource {
    fn read_cpu_totals(&mut self) -> std::io::Result<CpuTotals> {
        let text = std::fs::read_to_string("/proc/stat")?;
        let line = text
            .lines()
            .find(|l| l.starts_with("cpu "))
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "no cpu line"))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|f| f.parse().ok())
            .collect();
        // user nice system idle iowait irq softirq steal [guest guest_nice]
        let idle = fields.get(3).copied().unwrap_or(0) + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().copied().sum();
        Ok(CpuTotals { idle, total })
    }

    fn read_mem_pct(&mut self) -> std::io::Result<f64> {
        let text = std::fs::read_to_string("/proc/meminfo")?;
        let mut fields: HashMap<&str, u64> = HashMap::new();
        for line in text.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            let value = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            fields.insert(key, value);
        }
        let total = *fields.get("MemTotal").unwrap_or(&0);
        let available = *fields.get("MemAvailable").unwrap_or(&total);
        if total == 0 {
            return Ok(0.0);
        }
        Ok(100.0 * (1.0 - available as f64 / total as f64))
    }
}

/// Samples CPU utilization as a delta between successive reads (jiffy
/// counters are cumulative since boot) and memory utilization as an
/// instantaneous snapshot.
pub struct SystemLoadSampler {
    source: Box<dyn SystemStatSource>,
    prev_cpu: Option<CpuTotals>,
}

impl SystemLoadSampler {
    pub fn new() -> Self {
        Self::with_source(Box::new(ProcStatSource))
    }

    pub fn with_source(source: Box<dyn SystemStatSource>) -> Self {
        Self { source, prev_cpu: None }
    }

    /// Returns `None` when `/proc` is unavailable (non-Linux) or on the very
    /// first call (no delta yet to compute CPU% from).
    pub fn sample(&mut self) -> Option<SystemLoad> {
        let memory_pct = self.source.read_mem_pct().unwrap_or(0.0);
        let cpu = self.source.read_cpu_totals().ok()?;
        let cpu_pct = match self.prev_cpu {
            Some(prev) => {
                let total_delta = cpu.total.saturating_sub(prev.total);
                let idle_delta = cpu.idle.saturating_sub(prev.idle);
                if total_delta == 0 {
                    0.0
                } else {
                    100.0 * (1.0 - idle_delta as f64 / total_delta as f64)
                }
            }
            None => {
                self.prev_cpu = Some(cpu);
                return None;
            }
        };
        self.prev_cpu = Some(cpu);
        Some(SystemLoad { cpu_pct, memory_pct })
    }
}

impl Default for SystemLoadSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct FakeSource {
        cpu: VecDeque<CpuTotals>,
        mem_pct: f64,
    }

    impl SystemStatSource for FakeSource {
        fn read_cpu_totals(&mut self) -> std::io::Result<CpuTotals> {
            Ok(self.cpu.pop_front().unwrap_or_default())
        }

        fn read_mem_pct(&mut self) -> std::io::Result<f64> {
            Ok(self.mem_pct)
        }
    }

    #[test]
    fn first_sample_has_no_baseline_and_returns_none() {
        let mut sampler = SystemLoadSampler::with_source(Box::new(FakeSource {
            cpu: VecDeque::from([CpuTotals { idle: 100, total: 200 }]),
            mem_pct: 50.0,
        }));
        assert!(sampler.sample().is_none());
    }

    #[test]
    fn second_sample_derives_cpu_pct_from_the_delta() {
        let mut sampler = SystemLoadSampler::with_source(Box::new(FakeSource {
            cpu: VecDeque::from([
                CpuTotals { idle: 100, total: 200 },
                CpuTotals { idle: 120, total: 300 },
            ]),
            mem_pct: 42.0,
        }));
        assert!(sampler.sample().is_none());
        let load = sampler.sample().unwrap();
        // idle_delta=20, total_delta=100 -> 80% busy
        assert!((load.cpu_pct - 80.0).abs() < 1e-9);
        assert!((load.memory_pct - 42.0).abs() < 1e-9);
    }
}

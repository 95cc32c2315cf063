//! `ETACalculator` (§4.8): five estimation algorithms over a bounded ring of
//! progress samples, each reporting `(eta, confidence, trend)` rather than a
//! bare duration so callers can choose how much to trust a given estimate.
//!
//! This sits alongside, not in place of, `scheduler::progress::ProgressStats`
//! — that type remains the lightweight single-rate estimate used by plain
//! HTTP range downloads. `ETACalculator` is for HLS jobs, where throughput
//! is segment-by-segment and bursty enough that a single average undersells
//! what a regression or exponential smoothing can do.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct ProgressSample {
    pub at: Instant,
    pub bytes_done: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtaAlgorithm {
    SimpleLinear,
    ExponentialSmoothing,
    WeightedAverage,
    RegressionBased,
    AdaptiveHybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
    Unknown,
}

/// Result of `EtaCalculator::estimate` (§4.8's
/// `eta(total_bytes, bytes_downloaded) -> (eta_seconds, confidence, trend,
/// metadata)` contract; `metadata` is the `chosen` field on `AdaptiveHybrid`
/// runs, `None` for a directly-requested single algorithm).
#[derive(Debug, Clone, Copy)]
pub struct EtaEstimate {
    pub eta: Option<Duration>,
    pub confidence: f64,
    pub trend: Trend,
    pub chosen: Option<EtaAlgorithm>,
}

impl EtaEstimate {
    fn unknown() -> Self {
        Self {
            eta: None,
            confidence: 0.0,
            trend: Trend::Unknown,
            chosen: None,
        }
    }
}

const EXP_SMOOTHING_ALPHA: f64 = 0.3;
/// Time-decay half-scale for the weighted-average algorithm, in seconds.
const WEIGHTED_AVERAGE_DECAY_SECS: f64 = 60.0;
/// A rate change beyond this fraction, compared to the rate derived from the
/// first half of the window vs. the second half, counts as a trend.
const TREND_THRESHOLD: f64 = 0.10;

pub struct EtaCalculator {
    capacity: usize,
    samples: VecDeque<ProgressSample>,
}

impl EtaCalculator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            samples: VecDeque::with_capacity(capacity.max(2)),
        }
    }

    pub fn record(&mut self, bytes_done: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(ProgressSample {
            at: Instant::now(),
            bytes_done,
        });
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Estimate remaining time and confidence using `algorithm`. Returns
    /// `eta = None, confidence = 0, trend = Unknown` (never an error) when
    /// speed is non-positive or samples are insufficient, per §4.8.
    pub fn estimate(&self, algorithm: EtaAlgorithm, total_bytes: u64) -> EtaEstimate {
        let Some(last) = self.samples.back() else {
            return EtaEstimate::unknown();
        };
        let remaining = total_bytes.saturating_sub(last.bytes_done);
        let trend = self.trend();

        if remaining == 0 {
            return EtaEstimate {
                eta: Some(Duration::ZERO),
                confidence: 1.0,
                trend,
                chosen: Some(algorithm),
            };
        }
        if self.samples.len() < 2 {
            return EtaEstimate::unknown();
        }

        match algorithm {
            EtaAlgorithm::SimpleLinear => self.simple_linear(remaining, trend),
            EtaAlgorithm::ExponentialSmoothing => self.exponential_smoothing(remaining, trend),
            EtaAlgorithm::WeightedAverage => self.weighted_average(remaining, trend),
            EtaAlgorithm::RegressionBased => self.regression_based(remaining, trend),
            EtaAlgorithm::AdaptiveHybrid => self.adaptive_hybrid(remaining, trend),
        }
    }

    fn rate_between(&self, a: &ProgressSample, b: &ProgressSample) -> Option<f64> {
        let dt = b.at.duration_since(a.at).as_secs_f64();
        if dt <= 0.0 {
            return None;
        }
        Some((b.bytes_done.saturating_sub(a.bytes_done)) as f64 / dt)
    }

    fn eta_from_rate(rate: f64, remaining: u64) -> Option<Duration> {
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }

    /// Mean speed of the last 10 samples. Confidence = `min(samples/10, 1)`.
    fn simple_linear(&self, remaining: u64, trend: Trend) -> EtaEstimate {
        let window: Vec<_> = self.last_n(10);
        let rate = Self::mean_rate(&window);
        let confidence = (window.len() as f64 / 10.0).min(1.0);
        match rate.and_then(|r| Self::eta_from_rate(r, remaining)) {
            Some(eta) => EtaEstimate {
                eta: Some(eta),
                confidence,
                trend,
                chosen: Some(EtaAlgorithm::SimpleLinear),
            },
            None => EtaEstimate::unknown(),
        }
    }

    /// EWMA over consecutive sample-to-sample rates, alpha = 0.3.
    /// Confidence = `min(samples/5, 1)`.
    fn exponential_smoothing(&self, remaining: u64, trend: Trend) -> EtaEstimate {
        let mut iter = self.samples.iter();
        let Some(mut prev) = iter.next() else {
            return EtaEstimate::unknown();
        };
        let mut smoothed: Option<f64> = None;
        for cur in iter {
            if let Some(rate) = self.rate_between(prev, cur) {
                smoothed = Some(match smoothed {
                    Some(s) => EXP_SMOOTHING_ALPHA * rate + (1.0 - EXP_SMOOTHING_ALPHA) * s,
                    None => rate,
                });
            }
            prev = cur;
        }
        let confidence = (self.samples.len() as f64 / 5.0).min(1.0);
        match smoothed.and_then(|r| Self::eta_from_rate(r, remaining)) {
            Some(eta) => EtaEstimate {
                eta: Some(eta),
                confidence,
                trend,
                chosen: Some(EtaAlgorithm::ExponentialSmoothing),
            },
            None => EtaEstimate::unknown(),
        }
    }

    /// Rates weighted by recency: `exp(-age_secs / 60)` (one-minute half-life).
    fn weighted_average(&self, remaining: u64, trend: Trend) -> EtaEstimate {
        let Some(now) = self.samples.back().map(|s| s.at) else {
            return EtaEstimate::unknown();
        };
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut iter = self.samples.iter();
        let Some(mut prev) = iter.next() else {
            return EtaEstimate::unknown();
        };
        for cur in iter {
            if let Some(rate) = self.rate_between(prev, cur) {
                let age = now.duration_since(cur.at).as_secs_f64();
                let weight = (-age / WEIGHTED_AVERAGE_DECAY_SECS).exp();
                weighted_sum += rate * weight;
                weight_total += weight;
            }
            prev = cur;
        }
        let confidence = (self.samples.len() as f64 / 10.0).min(1.0);
        if weight_total <= 0.0 {
            return EtaEstimate::unknown();
        }
        match Self::eta_from_rate(weighted_sum / weight_total, remaining) {
            Some(eta) => EtaEstimate {
                eta: Some(eta),
                confidence,
                trend,
                chosen: Some(EtaAlgorithm::WeightedAverage),
            },
            None => EtaEstimate::unknown(),
        }
    }

    /// Ordinary least squares of `bytes_done` against elapsed seconds; the
    /// fitted slope is the predicted throughput. Confidence = R², clamped to
    /// `[0, 1]`. Requires >= 3 samples.
    fn regression_based(&self, remaining: u64, trend: Trend) -> EtaEstimate {
        if self.samples.len() < 3 {
            return EtaEstimate::unknown();
        }
        let Some((slope, r_squared)) = self.ols_fit() else {
            return EtaEstimate::unknown();
        };
        match Self::eta_from_rate(slope, remaining) {
            Some(eta) => EtaEstimate {
                eta: Some(eta),
                confidence: r_squared.clamp(0.0, 1.0),
                trend,
                chosen: Some(EtaAlgorithm::RegressionBased),
            },
            None => EtaEstimate::unknown(),
        }
    }

    fn ols_fit(&self) -> Option<(f64, f64)> {
        let first_at = self.samples.front()?.at;
        let n = self.samples.len() as f64;
        let xs: Vec<f64> = self
            .samples
            .iter()
            .map(|s| s.at.duration_since(first_at).as_secs_f64())
            .collect();
        let ys: Vec<f64> = self.samples.iter().map(|s| s.bytes_done as f64).collect();

        let x_mean = xs.iter().sum::<f64>() / n;
        let y_mean = ys.iter().sum::<f64>() / n;

        let mut cov = 0.0;
        let mut var_x = 0.0;
        for (x, y) in xs.iter().zip(ys.iter()) {
            cov += (x - x_mean) * (y - y_mean);
            var_x += (x - x_mean).powi(2);
        }
        if var_x <= 0.0 {
            return None;
        }
        let slope = cov / var_x;
        let intercept = y_mean - slope * x_mean;

        let mut ss_res = 0.0;
        let mut ss_tot = 0.0;
        for (x, y) in xs.iter().zip(ys.iter()) {
            let predicted = slope * x + intercept;
            ss_res += (y - predicted).powi(2);
            ss_tot += (y - y_mean).powi(2);
        }
        let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };
        Some((slope, r_squared))
    }

    /// Runs all four other algorithms and picks the highest-confidence
    /// result, then multiplies its confidence by a data-quality factor
    /// `0.4*sample_count_factor + 0.4*consistency + 0.2*recency` (§4.8).
    fn adaptive_hybrid(&self, remaining: u64, trend: Trend) -> EtaEstimate {
        let candidates = [
            self.simple_linear(remaining, trend),
            self.exponential_smoothing(remaining, trend),
            self.weighted_average(remaining, trend),
            self.regression_based(remaining, trend),
        ];
        let Some(best) = candidates
            .into_iter()
            .filter(|e| e.eta.is_some())
            .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap())
        else {
            return EtaEstimate::unknown();
        };

        let sample_count_factor = (self.samples.len() as f64 / 10.0).min(1.0);
        let consistency = self.rate_consistency();
        let recency = 1.0; // the ring always holds the most recent samples.
        let data_quality = 0.4 * sample_count_factor + 0.4 * consistency + 0.2 * recency;

        EtaEstimate {
            eta: best.eta,
            confidence: (best.confidence * data_quality).clamp(0.0, 1.0),
            trend,
            chosen: best.chosen,
        }
    }

    /// `1 - coefficient_of_variation` of consecutive sample-to-sample rates,
    /// clamped to `[0, 1]`: steady throughput scores near 1, bursty near 0.
    fn rate_consistency(&self) -> f64 {
        let rates: Vec<f64> = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .filter_map(|(a, b)| self.rate_between(a, b))
            .filter(|r| *r > 0.0)
            .collect();
        if rates.len() < 2 {
            return 0.5;
        }
        let mean = rates.iter().sum::<f64>() / rates.len() as f64;
        if mean <= 0.0 {
            return 0.0;
        }
        let variance = rates.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / rates.len() as f64;
        let cv = variance.sqrt() / mean;
        (1.0 - cv).clamp(0.0, 1.0)
    }

    fn last_n(&self, n: usize) -> Vec<ProgressSample> {
        let len = self.samples.len();
        let skip = len.saturating_sub(n);
        self.samples.iter().skip(skip).cloned().collect()
    }

    fn mean_rate(window: &[ProgressSample]) -> Option<f64> {
        let rates: Vec<f64> = window
            .iter()
            .zip(window.iter().skip(1))
            .filter_map(|(a, b)| {
                let dt = b.at.duration_since(a.at).as_secs_f64();
                if dt <= 0.0 {
                    None
                } else {
                    Some(b.bytes_done.saturating_sub(a.bytes_done) as f64 / dt)
                }
            })
            .collect();
        if rates.is_empty() {
            return None;
        }
        Some(rates.iter().sum::<f64>() / rates.len() as f64)
    }

    /// Compare the average rate across the first and second half of the
    /// last 10 samples to classify the overall trend (§4.8: +/-10% threshold).
    pub fn trend(&self) -> Trend {
        let window = self.last_n(10);
        if window.len() < 4 {
            return Trend::Unknown;
        }
        let mid = window.len() / 2;
        let first_half = &window[..=mid];
        let second_half = &window[mid..];

        let rate_of = |w: &[ProgressSample]| -> Option<f64> {
            let first = w.first()?;
            let last = w.last()?;
            self.rate_between(first, last)
        };

        let (Some(r1), Some(r2)) = (rate_of(first_half), rate_of(second_half)) else {
            return Trend::Unknown;
        };
        if r1 <= 0.0 {
            return Trend::Unknown;
        }
        let change = (r2 - r1) / r1;
        if change > TREND_THRESHOLD {
            Trend::Increasing
        } else if change < -TREND_THRESHOLD {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }
}

//! `PrioritizationEngine` (§4.7): combines the eight weighted factors into a
//! single score, with bounded adaptive weight learning.
//!
//! Weights are normalized to sum to 1 at construction and after every
//! learning update. The adaptive rule (an Open Question in the distilled
//! design) is a fixed-step nudge: whichever factors agreed with the task's
//! actual outcome get a small weight increase, the rest a small decrease,
//! each individual weight clamped to `[0.01, 0.5]` before renormalizing.

use crate::config::PrioritizationConfig;

use super::factors::{FactorScores, TaskFactorInputs};

const LEARNING_STEP: f64 = 0.01;
const MIN_WEIGHT: f64 = 0.01;
const MAX_WEIGHT: f64 = 0.5;
/// A factor score above this threshold is considered to have predicted
/// success; below it, predicted failure.
const AGREEMENT_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct Weights {
    pub file_size: f64,
    pub user_preference: f64,
    pub system_resources: f64,
    pub historical_performance: f64,
    pub time_sensitivity: f64,
    pub dependency_chain: f64,
    pub bandwidth_efficiency: f64,
    pub completion_probability: f64,
}

impl Weights {
    fn sum(&self) -> f64 {
        self.file_size
            + self.user_preference
            + self.system_resources
            + self.historical_performance
            + self.time_sensitivity
            + self.dependency_chain
            + self.bandwidth_efficiency
            + self.completion_probability
    }

    fn normalize(&mut self) {
        let sum = self.sum();
        if sum <= 0.0 {
            return;
        }
        self.file_size /= sum;
        self.user_preference /= sum;
        self.system_resources /= sum;
        self.historical_performance /= sum;
        self.time_sensitivity /= sum;
        self.dependency_chain /= sum;
        self.bandwidth_efficiency /= sum;
        self.completion_probability /= sum;
    }

    fn dot(&self, scores: &FactorScores) -> f64 {
        self.file_size * scores.file_size
            + self.user_preference * scores.user_preference
            + self.system_resources * scores.system_resources
            + self.historical_performance * scores.historical_performance
            + self.time_sensitivity * scores.time_sensitivity
            + self.dependency_chain * scores.dependency_chain
            + self.bandwidth_efficiency * scores.bandwidth_efficiency
            + self.completion_probability * scores.completion_probability
    }
}

impl From<&PrioritizationConfig> for Weights {
    fn from(cfg: &PrioritizationConfig) -> Self {
        let mut w = Weights {
            file_size: cfg.weight_file_size,
            user_preference: cfg.weight_user_preference,
            system_resources: cfg.weight_system_resources,
            historical_performance: cfg.weight_historical_performance,
            time_sensitivity: cfg.weight_time_sensitivity,
            dependency_chain: cfg.weight_dependency_chain,
            bandwidth_efficiency: cfg.weight_bandwidth_efficiency,
            completion_probability: cfg.weight_completion_probability,
        };
        w.normalize();
        w
    }
}

pub struct PrioritizationEngine {
    weights: Weights,
    adaptive_learning: bool,
}

/// Result of scoring one task: the combined priority plus a confidence in
/// that number (how much the eight factors agree with one another).
#[derive(Debug, Clone, Copy)]
pub struct PriorityScore {
    pub score: f64,
    pub confidence: f64,
    pub factors: FactorScores,
}

impl PrioritizationEngine {
    pub fn new(config: &PrioritizationConfig) -> Self {
        Self {
            weights: Weights::from(config),
            adaptive_learning: config.adaptive_learning,
        }
    }

    pub fn weights(&self) -> Weights {
        self.weights
    }

    pub fn score(&self, inputs: &TaskFactorInputs) -> PriorityScore {
        let factors = FactorScores::compute(inputs);
        let score = self.weights.dot(&factors);
        let confidence = Self::confidence(&factors, inputs);
        PriorityScore {
            score,
            confidence,
            factors,
        }
    }

    /// `0.4*historical_data + 0.4*(1 - variance_of_factor_scores) +
    /// 0.2*information_completeness`, clamped to `[0.1, 1]` (§4.7).
    fn confidence(factors: &FactorScores, inputs: &TaskFactorInputs) -> f64 {
        let historical_data = if inputs.historical_success_rate.is_some() {
            1.0
        } else {
            0.3
        };

        let known_optional_inputs = [
            inputs.historical_success_rate.is_some(),
            inputs.seconds_until_deadline.is_some(),
            inputs.available_bandwidth_bps.is_some() && inputs.required_bandwidth_bps.is_some(),
        ];
        let information_completeness = known_optional_inputs.iter().filter(|k| **k).count() as f64
            / known_optional_inputs.len() as f64;

        let values = [
            factors.file_size,
            factors.user_preference,
            factors.system_resources,
            factors.historical_performance,
            factors.time_sensitivity,
            factors.dependency_chain,
            factors.bandwidth_efficiency,
            factors.completion_probability,
        ];
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;

        let raw = 0.4 * historical_data + 0.4 * (1.0 - variance) + 0.2 * information_completeness;
        raw.clamp(0.1, 1.0)
    }

    /// After a task finishes, nudge weights toward factors whose score
    /// agreed with the actual `succeeded` outcome. No-ops if adaptive
    /// learning is disabled in config.
    pub fn record_outcome(&mut self, factors: &FactorScores, succeeded: bool) {
        if !self.adaptive_learning {
            return;
        }

        let predicted_success = |v: f64| v >= AGREEMENT_THRESHOLD;
        let nudge = |w: &mut f64, factor_value: f64| {
            let agreed = predicted_success(factor_value) == succeeded;
            let step = if agreed { LEARNING_STEP } else { -LEARNING_STEP };
            *w = (*w + step).clamp(MIN_WEIGHT, MAX_WEIGHT);
        };

        nudge(&mut self.weights.file_size, factors.file_size);
        nudge(&mut self.weights.user_preference, factors.user_preference);
        nudge(&mut self.weights.system_resources, factors.system_resources);
        nudge(&mut self.weights.historical_performance, factors.historical_performance);
        nudge(&mut self.weights.time_sensitivity, factors.time_sensitivity);
        nudge(&mut self.weights.dependency_chain, factors.dependency_chain);
        nudge(&mut self.weights.bandwidth_efficiency, factors.bandwidth_efficiency);
        nudge(&mut self.weights.completion_probability, factors.completion_probability);

        self.weights.normalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inputs() -> TaskFactorInputs {
        TaskFactorInputs {
            file_size_bytes: 10,
            user_priority: 2,
            cpu_usage: 0.2,
            memory_usage: 0.2,
            resource_intensity: 0.4,
            historical_success_rate: Some(0.9),
            seconds_until_deadline: Some(60.0),
            age_hours: 1.0,
            dependent_task_count: 2,
            available_bandwidth_bps: Some(700.0),
            required_bandwidth_bps: Some(1000.0),
        }
    }

    #[test]
    fn weights_normalize_to_one() {
        let cfg = PrioritizationConfig::default();
        let engine = PrioritizationEngine::new(&cfg);
        let w = engine.weights();
        let sum = w.file_size
            + w.user_preference
            + w.system_resources
            + w.historical_performance
            + w.time_sensitivity
            + w.dependency_chain
            + w.bandwidth_efficiency
            + w.completion_probability;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn score_is_bounded_0_to_1() {
        let cfg = PrioritizationConfig::default();
        let engine = PrioritizationEngine::new(&cfg);
        let result = engine.score(&sample_inputs());
        assert!(result.score >= 0.0 && result.score <= 1.0);
        assert!(result.confidence >= 0.0 && result.confidence <= 1.0);
    }

    #[test]
    fn adaptive_learning_stays_normalized_and_bounded() {
        let cfg = PrioritizationConfig::default();
        let mut engine = PrioritizationEngine::new(&cfg);
        let result = engine.score(&sample_inputs());
        for _ in 0..50 {
            engine.record_outcome(&result.factors, true);
        }
        let w = engine.weights();
        let sum = w.file_size
            + w.user_preference
            + w.system_resources
            + w.historical_performance
            + w.time_sensitivity
            + w.dependency_chain
            + w.bandwidth_efficiency
            + w.completion_probability;
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(w.file_size >= MIN_WEIGHT && w.file_size <= MAX_WEIGHT);
        assert!(w.completion_probability >= MIN_WEIGHT && w.completion_probability <= MAX_WEIGHT);
    }

    #[test]
    fn disabled_adaptive_learning_leaves_weights_untouched() {
        let mut cfg = PrioritizationConfig::default();
        cfg.adaptive_learning = false;
        let mut engine = PrioritizationEngine::new(&cfg);
        let before = engine.weights();
        let result = engine.score(&sample_inputs());
        engine.record_outcome(&result.factors, false);
        let after = engine.weights();
        assert_eq!(before.file_size, after.file_size);
    }
}

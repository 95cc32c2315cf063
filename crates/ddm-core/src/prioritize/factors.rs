//! The eight weighted factors behind task prioritization (§4.7).
//!
//! Each factor is normalized to `[0.0, 1.0]` before weighting so the engine
//! can combine them with a single dot product regardless of the factor's
//! native unit (bytes, a 1..5 user rating, a load fraction, ...). Formulas
//! below are literal transcriptions of the factor table, not reinventions:
//! piecewise size buckets, the deadline breakpoints, and the dependency
//! count bands are all fixed points, not tunables.

const MB: f64 = 1_000_000.0;
const GB: f64 = 1_000_000_000.0;
const HOUR: f64 = 3600.0;
const DAY: f64 = 86_400.0;
const WEEK: f64 = 604_800.0;

/// Raw, factor-specific inputs collected for one task at scoring time.
#[derive(Debug, Clone, Copy)]
pub struct TaskFactorInputs {
    /// Total task size in bytes.
    pub file_size_bytes: u64,
    /// User-assigned priority, 1 (most urgent) to 5 (least urgent).
    pub user_priority: u8,
    /// Current CPU utilization, in `[0.0, 1.0]`.
    pub cpu_usage: f64,
    /// Current memory utilization, in `[0.0, 1.0]`.
    pub memory_usage: f64,
    /// This task's expected resource demand, in `[0.0, 1.0]` (0 = light,
    /// e.g. a small text manifest; 1 = heavy, e.g. a 4K segment burst).
    pub resource_intensity: f64,
    /// Mean success rate of size-similar prior tasks, when known.
    pub historical_success_rate: Option<f64>,
    /// Seconds until the task's deadline, if one was declared. Negative or
    /// zero means overdue.
    pub seconds_until_deadline: Option<f64>,
    /// Task age, used for the time-sensitivity score when no deadline was
    /// declared.
    pub age_hours: f64,
    /// Number of other tasks blocked on this one completing first.
    pub dependent_task_count: usize,
    /// Estimated available bandwidth, bytes/sec, when known.
    pub available_bandwidth_bps: Option<f64>,
    /// Bandwidth this task needs to complete acceptably, bytes/sec, when
    /// known.
    pub required_bandwidth_bps: Option<f64>,
}

/// Normalized score per factor, in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FactorScores {
    pub file_size: f64,
    pub user_preference: f64,
    pub system_resources: f64,
    pub historical_performance: f64,
    pub time_sensitivity: f64,
    pub dependency_chain: f64,
    pub bandwidth_efficiency: f64,
    pub completion_probability: f64,
}

impl FactorScores {
    pub fn compute(inputs: &TaskFactorInputs) -> Self {
        let file_size = file_size_score(inputs.file_size_bytes);
        let user_preference = (((inputs.user_priority.max(1) as f64) - 1.0) / 4.0).clamp(0.0, 1.0);
        let system_resources = system_resources_score(inputs);
        let historical_performance = inputs.historical_success_rate.unwrap_or(0.7).clamp(0.0, 1.0);
        let time_sensitivity = time_sensitivity_score(inputs);
        let dependency_chain = dependency_chain_score(inputs.dependent_task_count);
        let bandwidth_efficiency = bandwidth_efficiency_score(inputs);
        // "historical_success x size_factor x resource_score" (§4.7).
        let completion_probability =
            (historical_performance * file_size * system_resources).clamp(0.0, 1.0);

        Self {
            file_size,
            user_preference,
            system_resources,
            historical_performance,
            time_sensitivity,
            dependency_chain,
            bandwidth_efficiency,
            completion_probability,
        }
    }
}

/// Piecewise file-size bucketing (§4.7): smaller downloads score higher so
/// quick wins clear the queue ahead of multi-gigabyte transfers.
fn file_size_score(bytes: u64) -> f64 {
    let bytes = bytes as f64;
    if bytes < MB {
        1.0
    } else if bytes < 10.0 * MB {
        0.9
    } else if bytes < 100.0 * MB {
        0.7
    } else if bytes < GB {
        0.5
    } else if bytes < 5.0 * GB {
        0.3
    } else {
        0.1
    }
}

/// `1 - |available - intensity|` where `available = (2 - cpu - memory) / 2`
/// (§4.7): a task whose expected resource demand matches current headroom
/// scores highest, whether that headroom is generous or scarce.
fn system_resources_score(inputs: &TaskFactorInputs) -> f64 {
    let available = (2.0 - inputs.cpu_usage - inputs.memory_usage) / 2.0;
    (1.0 - (available - inputs.resource_intensity).abs()).clamp(0.0, 1.0)
}

fn time_sensitivity_score(inputs: &TaskFactorInputs) -> f64 {
    match inputs.seconds_until_deadline {
        Some(secs) if secs <= 0.0 => 1.0,
        Some(secs) if secs < HOUR => 0.95,
        Some(secs) if secs < DAY => 0.8,
        Some(secs) if secs < WEEK => 0.6,
        Some(_) => 0.4,
        None => (0.5 + inputs.age_hours / 168.0).min(1.0),
    }
}

/// 0 deps -> 0.5; <=2 -> 0.7; <=5 -> 0.8; else -> 0.9 (§4.7).
fn dependency_chain_score(dependent_task_count: usize) -> f64 {
    match dependent_task_count {
        0 => 0.5,
        1..=2 => 0.7,
        3..=5 => 0.8,
        _ => 0.9,
    }
}

fn bandwidth_efficiency_score(inputs: &TaskFactorInputs) -> f64 {
    match (inputs.available_bandwidth_bps, inputs.required_bandwidth_bps) {
        (Some(available), Some(required)) if required > 0.0 => (available / required).min(1.0),
        _ => 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs() -> TaskFactorInputs {
        TaskFactorInputs {
            file_size_bytes: 0,
            user_priority: 1,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            resource_intensity: 0.5,
            historical_success_rate: None,
            seconds_until_deadline: None,
            age_hours: 0.0,
            dependent_task_count: 0,
            available_bandwidth_bps: None,
            required_bandwidth_bps: None,
        }
    }

    #[test]
    fn file_size_buckets_match_spec_table() {
        assert_eq!(file_size_score(500_000), 1.0);
        assert_eq!(file_size_score(5_000_000), 0.9);
        assert_eq!(file_size_score(50_000_000), 0.7);
        assert_eq!(file_size_score(500_000_000), 0.5);
        assert_eq!(file_size_score(2_000_000_000), 0.3);
        assert_eq!(file_size_score(10_000_000_000), 0.1);
    }

    #[test]
    fn user_preference_maps_urgent_to_zero_and_low_to_one() {
        let mut inputs = base_inputs();
        inputs.user_priority = 1;
        assert_eq!(FactorScores::compute(&inputs).user_preference, 0.0);
        inputs.user_priority = 5;
        assert_eq!(FactorScores::compute(&inputs).user_preference, 1.0);
    }

    #[test]
    fn overdue_deadline_scores_one() {
        let mut inputs = base_inputs();
        inputs.seconds_until_deadline = Some(-5.0);
        assert_eq!(FactorScores::compute(&inputs).time_sensitivity, 1.0);
    }

    #[test]
    fn no_deadline_uses_age_based_score() {
        let mut inputs = base_inputs();
        inputs.age_hours = 168.0;
        assert_eq!(FactorScores::compute(&inputs).time_sensitivity, 1.0);
        inputs.age_hours = 0.0;
        assert_eq!(FactorScores::compute(&inputs).time_sensitivity, 0.5);
    }

    #[test]
    fn dependency_chain_bands_match_spec_table() {
        assert_eq!(dependency_chain_score(0), 0.5);
        assert_eq!(dependency_chain_score(2), 0.7);
        assert_eq!(dependency_chain_score(5), 0.8);
        assert_eq!(dependency_chain_score(6), 0.9);
    }

    #[test]
    fn bandwidth_efficiency_defaults_to_half_when_unknown() {
        let inputs = base_inputs();
        assert_eq!(FactorScores::compute(&inputs).bandwidth_efficiency, 0.5);
    }

    #[test]
    fn bandwidth_efficiency_caps_at_one() {
        let mut inputs = base_inputs();
        inputs.available_bandwidth_bps = Some(10.0);
        inputs.required_bandwidth_bps = Some(2.0);
        assert_eq!(FactorScores::compute(&inputs).bandwidth_efficiency, 1.0);
    }

    #[test]
    fn system_resources_peaks_when_headroom_matches_intensity() {
        let mut inputs = base_inputs();
        inputs.cpu_usage = 0.5;
        inputs.memory_usage = 0.5;
        // available = (2 - 0.5 - 0.5) / 2 = 0.5
        inputs.resource_intensity = 0.5;
        assert_eq!(FactorScores::compute(&inputs).system_resources, 1.0);
    }
}

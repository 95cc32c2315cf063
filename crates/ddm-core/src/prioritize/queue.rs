//! `QueueScheduler` (§4.7): admission control over pending/running/terminal
//! task sets, ordering pending tasks by one of four strategies and gating
//! admission on declared dependencies.

use std::collections::{HashMap, HashSet, VecDeque};

use super::engine::PrioritizationEngine;
use super::factors::{FactorScores, TaskFactorInputs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingStrategy {
    /// Sort by (priority ascending, created-at ascending).
    PriorityFirst,
    /// Within each priority band, sort by file size ascending.
    SizeOptimized,
    /// `0.5*priority + 0.3*size_score + 0.2*duration_score`, higher wins.
    TimeBalanced,
    /// Shrinks the effective concurrency limit under load, then delegates
    /// to `SizeOptimized` (constrained) or `PriorityFirst` (unconstrained).
    ResourceAware,
}

/// Current system load, sampled by the caller (typically from
/// `BandwidthMonitor` plus an OS load probe) and passed in at each
/// admission tick so `ResourceAware` can react to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceLoad {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub network_pct: f64,
}

#[derive(Debug, Clone, Copy)]
struct QueuedTask {
    task_id: i64,
    /// Monotonic enqueue order, standing in for created-at: earlier tasks
    /// enqueue earlier, so sequence order is created-at order.
    sequence: u64,
    inputs: TaskFactorInputs,
}

pub struct QueueScheduler {
    strategy: SchedulingStrategy,
    max_concurrent: usize,
    pending: VecDeque<QueuedTask>,
    dependencies: std::collections::HashMap<i64, HashSet<i64>>,
    running: HashSet<i64>,
    completed: HashSet<i64>,
    terminal: HashSet<i64>,
    next_sequence: u64,
}

impl QueueScheduler {
    pub fn new(strategy: SchedulingStrategy, max_concurrent: usize) -> Self {
        Self {
            strategy,
            max_concurrent: max_concurrent.max(1),
            pending: VecDeque::new(),
            dependencies: std::collections::HashMap::new(),
            running: HashSet::new(),
            completed: HashSet::new(),
            terminal: HashSet::new(),
            next_sequence: 0,
        }
    }

    pub fn enqueue(&mut self, task_id: i64, inputs: TaskFactorInputs) {
        self.enqueue_with_dependencies(task_id, inputs, HashSet::new());
    }

    /// Enqueue a task that may only be admitted once every id in
    /// `depends_on` has reached `Completed`.
    pub fn enqueue_with_dependencies(
        &mut self,
        task_id: i64,
        inputs: TaskFactorInputs,
        depends_on: HashSet<i64>,
    ) {
        if self.running.contains(&task_id) || self.terminal.contains(&task_id) {
            return;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.dependencies.insert(task_id, depends_on);
        self.pending.push_back(QueuedTask {
            task_id,
            sequence,
            inputs,
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    fn has_capacity(&self, limit: usize) -> bool {
        self.running.len() < limit
    }

    fn dependencies_satisfied(&self, task_id: i64) -> bool {
        self.dependencies
            .get(&task_id)
            .map(|deps| deps.iter().all(|d| self.completed.contains(d)))
            .unwrap_or(true)
    }

    fn admissible_indices(&self) -> Vec<usize> {
        self.pending
            .iter()
            .enumerate()
            .filter(|(_, t)| self.dependencies_satisfied(t.task_id))
            .map(|(i, _)| i)
            .collect()
    }

    /// Select and admit the next pending, dependency-satisfied task per the
    /// configured strategy, if there is free concurrency capacity.
    pub fn admit_next(&mut self, engine: &PrioritizationEngine) -> Option<i64> {
        self.admit_next_under_load(engine, ResourceLoad::default())
    }

    /// Same as `admit_next` but lets `ResourceAware` react to current
    /// system load (§4.7: -1 concurrency slot when cpu/mem > 80%, -2 when
    /// network > 90%).
    pub fn admit_next_under_load(
        &mut self,
        engine: &PrioritizationEngine,
        load: ResourceLoad,
    ) -> Option<i64> {
        let (effective_strategy, effective_limit) = match self.strategy {
            SchedulingStrategy::ResourceAware => {
                let mut limit = self.max_concurrent;
                if load.cpu_pct > 80.0 || load.memory_pct > 80.0 {
                    limit = limit.saturating_sub(1);
                }
                if load.network_pct > 90.0 {
                    limit = limit.saturating_sub(2);
                }
                let limit = limit.max(1);
                let delegate = if limit < self.max_concurrent {
                    SchedulingStrategy::SizeOptimized
                } else {
                    SchedulingStrategy::PriorityFirst
                };
                (delegate, limit)
            }
            other => (other, self.max_concurrent),
        };

        if !self.has_capacity(effective_limit) || self.pending.is_empty() {
            return None;
        }

        let candidates = self.admissible_indices();
        if candidates.is_empty() {
            return None;
        }

        let best_index = match effective_strategy {
            SchedulingStrategy::PriorityFirst => candidates
                .into_iter()
                .min_by_key(|&i| {
                    let t = &self.pending[i];
                    (t.inputs.user_priority, t.sequence)
                }),
            SchedulingStrategy::SizeOptimized => candidates.into_iter().min_by_key(|&i| {
                let t = &self.pending[i];
                (t.inputs.user_priority, t.inputs.file_size_bytes)
            }),
            SchedulingStrategy::TimeBalanced => candidates.into_iter().max_by(|&a, &b| {
                time_balanced_score(&self.pending[a].inputs, engine)
                    .partial_cmp(&time_balanced_score(&self.pending[b].inputs, engine))
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
            SchedulingStrategy::ResourceAware => unreachable!("resolved above"),
        }?;

        let task = self.pending.remove(best_index)?;
        self.running.insert(task.task_id);
        Some(task.task_id)
    }

    pub fn mark_completed(&mut self, task_id: i64) {
        self.running.remove(&task_id);
        self.completed.insert(task_id);
        self.terminal.insert(task_id);
    }

    pub fn mark_failed(&mut self, task_id: i64) {
        self.running.remove(&task_id);
        self.terminal.insert(task_id);
    }

    pub fn is_terminal(&self, task_id: i64) -> bool {
        self.terminal.contains(&task_id)
    }

    /// `set_priority(task_id, priority)` (§6): re-scores a still-pending
    /// task in place. No-op (returns `false`) once the task has been
    /// admitted or reached a terminal state.
    pub fn set_priority(&mut self, task_id: i64, priority: u8) -> bool {
        match self.pending.iter_mut().find(|t| t.task_id == task_id) {
            Some(t) => {
                t.inputs.user_priority = priority;
                true
            }
            None => false,
        }
    }

    /// Removes a still-pending task from the queue entirely (§6 cancel/remove)
    /// without counting it as completed or failed for prioritization purposes.
    /// No-op (returns `false`) once the task has been admitted.
    pub fn remove_pending(&mut self, task_id: i64) -> bool {
        let before = self.pending.len();
        self.pending.retain(|t| t.task_id != task_id);
        let removed = self.pending.len() != before;
        if removed {
            self.terminal.insert(task_id);
            self.dependencies.remove(&task_id);
        }
        removed
    }

    /// `reorder(pending_order)` (§6): moves the named pending tasks to the
    /// front of the queue in the given order. Pending tasks not named in
    /// `order` keep their relative enqueue order, appended after.
    pub fn reorder(&mut self, order: &[i64]) {
        let mut by_id: HashMap<i64, QueuedTask> =
            self.pending.drain(..).map(|t| (t.task_id, t)).collect();
        let mut new_pending = VecDeque::with_capacity(by_id.len());
        for id in order {
            if let Some(t) = by_id.remove(id) {
                new_pending.push_back(t);
            }
        }
        let mut remaining: Vec<QueuedTask> = by_id.into_values().collect();
        remaining.sort_by_key(|t| t.sequence);
        new_pending.extend(remaining);
        self.pending = new_pending;
    }
}

/// `0.5*priority + 0.3*size_score + 0.2*duration_score` (§4.7). There is no
/// separate duration estimate in `TaskFactorInputs`, so `duration_score`
/// reuses the size-derived factor score (smaller files download faster);
/// see `DESIGN.md` for this call.
fn time_balanced_score(inputs: &TaskFactorInputs, engine: &PrioritizationEngine) -> f64 {
    let priority = engine.score(inputs).score;
    let factors = FactorScores::compute(inputs);
    0.5 * priority + 0.3 * factors.file_size + 0.2 * factors.file_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrioritizationConfig;

    fn inputs(file_size: u64, user_priority: u8, deadline: Option<f64>) -> TaskFactorInputs {
        TaskFactorInputs {
            file_size_bytes: file_size,
            user_priority,
            cpu_usage: 0.3,
            memory_usage: 0.3,
            resource_intensity: 0.5,
            historical_success_rate: Some(0.5),
            seconds_until_deadline: deadline,
            age_hours: 0.0,
            dependent_task_count: 0,
            available_bandwidth_bps: None,
            required_bandwidth_bps: None,
        }
    }

    #[test]
    fn size_optimized_admits_smallest_first_within_priority_band() {
        let mut q = QueueScheduler::new(SchedulingStrategy::SizeOptimized, 1);
        q.enqueue(1, inputs(900, 3, None));
        q.enqueue(2, inputs(10, 3, None));
        let engine = PrioritizationEngine::new(&PrioritizationConfig::default());
        assert_eq!(q.admit_next(&engine), Some(2));
    }

    #[test]
    fn priority_first_breaks_ties_on_enqueue_order() {
        let mut q = QueueScheduler::new(SchedulingStrategy::PriorityFirst, 1);
        q.enqueue(1, inputs(10, 3, None));
        q.enqueue(2, inputs(10, 3, None));
        let engine = PrioritizationEngine::new(&PrioritizationConfig::default());
        assert_eq!(q.admit_next(&engine), Some(1));
    }

    #[test]
    fn priority_first_prefers_lower_numeric_priority() {
        let mut q = QueueScheduler::new(SchedulingStrategy::PriorityFirst, 1);
        q.enqueue(1, inputs(10, 5, None));
        q.enqueue(2, inputs(10, 1, None));
        let engine = PrioritizationEngine::new(&PrioritizationConfig::default());
        assert_eq!(q.admit_next(&engine), Some(2));
    }

    #[test]
    fn admission_respects_max_concurrent() {
        let mut q = QueueScheduler::new(SchedulingStrategy::PriorityFirst, 1);
        q.enqueue(1, inputs(10, 3, None));
        q.enqueue(2, inputs(20, 3, None));
        let engine = PrioritizationEngine::new(&PrioritizationConfig::default());
        assert!(q.admit_next(&engine).is_some());
        assert_eq!(q.admit_next(&engine), None);
    }

    #[test]
    fn completed_task_frees_capacity() {
        let mut q = QueueScheduler::new(SchedulingStrategy::PriorityFirst, 1);
        q.enqueue(1, inputs(10, 3, None));
        q.enqueue(2, inputs(20, 3, None));
        let engine = PrioritizationEngine::new(&PrioritizationConfig::default());
        let first = q.admit_next(&engine).unwrap();
        q.mark_completed(first);
        assert!(q.admit_next(&engine).is_some());
    }

    #[test]
    fn dependent_task_waits_for_dependency_completion() {
        let mut q = QueueScheduler::new(SchedulingStrategy::PriorityFirst, 2);
        q.enqueue(1, inputs(10, 3, None));
        let mut deps = HashSet::new();
        deps.insert(1);
        q.enqueue_with_dependencies(2, inputs(10, 1, None), deps);
        let engine = PrioritizationEngine::new(&PrioritizationConfig::default());
        // Task 2 has the higher (lower-numeric) priority but depends on 1.
        assert_eq!(q.admit_next(&engine), Some(1));
        assert_eq!(q.admit_next(&engine), None);
        q.mark_completed(1);
        assert_eq!(q.admit_next(&engine), Some(2));
    }

    #[test]
    fn resource_aware_shrinks_limit_under_high_cpu() {
        let mut q = QueueScheduler::new(SchedulingStrategy::ResourceAware, 2);
        q.enqueue(1, inputs(10, 3, None));
        q.enqueue(2, inputs(10, 3, None));
        let engine = PrioritizationEngine::new(&PrioritizationConfig::default());
        let busy = ResourceLoad {
            cpu_pct: 95.0,
            memory_pct: 10.0,
            network_pct: 10.0,
        };
        assert!(q.admit_next_under_load(&engine, busy).is_some());
        // Effective limit dropped from 2 to 1 under high CPU.
        assert_eq!(q.admit_next_under_load(&engine, busy), None);
    }

    #[test]
    fn set_priority_reprioritizes_a_pending_task() {
        let mut q = QueueScheduler::new(SchedulingStrategy::PriorityFirst, 1);
        q.enqueue(1, inputs(10, 5, None));
        q.enqueue(2, inputs(10, 3, None));
        assert!(q.set_priority(1, 1));
        let engine = PrioritizationEngine::new(&PrioritizationConfig::default());
        // Task 1 was enqueued first but at priority 5; after reprioritizing
        // to 1 (most urgent) it should be admitted first.
        assert_eq!(q.admit_next(&engine), Some(1));
    }

    #[test]
    fn set_priority_on_unknown_task_is_a_no_op() {
        let mut q = QueueScheduler::new(SchedulingStrategy::PriorityFirst, 1);
        q.enqueue(1, inputs(10, 3, None));
        assert!(!q.set_priority(999, 1));
    }

    #[test]
    fn remove_pending_drops_task_and_prevents_admission() {
        let mut q = QueueScheduler::new(SchedulingStrategy::PriorityFirst, 2);
        q.enqueue(1, inputs(10, 3, None));
        q.enqueue(2, inputs(10, 3, None));
        assert!(q.remove_pending(1));
        let engine = PrioritizationEngine::new(&PrioritizationConfig::default());
        assert_eq!(q.admit_next(&engine), Some(2));
        assert_eq!(q.admit_next(&engine), None);
        assert!(q.is_terminal(1));
    }

    #[test]
    fn remove_pending_on_unknown_task_is_a_no_op() {
        let mut q = QueueScheduler::new(SchedulingStrategy::PriorityFirst, 1);
        q.enqueue(1, inputs(10, 3, None));
        assert!(!q.remove_pending(999));
    }

    #[test]
    fn reorder_moves_named_tasks_to_the_front() {
        let mut q = QueueScheduler::new(SchedulingStrategy::PriorityFirst, 3);
        q.enqueue(1, inputs(10, 3, None));
        q.enqueue(2, inputs(10, 3, None));
        q.enqueue(3, inputs(10, 3, None));
        q.reorder(&[3, 1]);
        let engine = PrioritizationEngine::new(&PrioritizationConfig::default());
        assert_eq!(q.admit_next(&engine), Some(3));
        assert_eq!(q.admit_next(&engine), Some(1));
        assert_eq!(q.admit_next(&engine), Some(2));
    }

    #[test]
    fn time_balanced_prefers_higher_combined_score() {
        let mut q = QueueScheduler::new(SchedulingStrategy::TimeBalanced, 1);
        q.enqueue(1, inputs(5_000_000_000, 5, None));
        q.enqueue(2, inputs(10, 1, None));
        let engine = PrioritizationEngine::new(&PrioritizationConfig::default());
        assert_eq!(q.admit_next(&engine), Some(2));
    }
}

//! `BatchAggregator` (§4.10): rolls per-task progress up into a combined
//! view for a named group of tasks, firing a completion callback exactly
//! once when every member reaches a terminal state.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::BatchConfig;
use crate::task::TaskState;

/// The aggregator's view of one member task's current progress, pushed in
/// by the scheduler on every progress update.
#[derive(Debug, Clone, Copy)]
pub struct TaskProgress {
    pub state: TaskState,
    pub bytes_done: u64,
    /// `None` when the task's total size isn't known yet (e.g. before the
    /// manifest/HEAD probe completes).
    pub total_bytes: Option<u64>,
    pub bytes_per_sec: f64,
}

impl TaskProgress {
    fn percent(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => (self.bytes_done as f64 / total as f64).min(1.0),
            _ => {
                if self.state == TaskState::Completed {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            TaskState::Running | TaskState::Retrying | TaskState::Resuming
        )
    }
}

/// Combined progress for one batch, recomputed on every member update.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchProgress {
    /// Overall fraction complete in `[0, 1]`.
    pub percent: f64,
    /// Sum of `bytes_per_sec` across currently-active members.
    pub combined_speed_bps: f64,
    pub completed_tasks: usize,
    pub total_tasks: usize,
    pub eta: Option<Duration>,
}

struct BatchState {
    member_ids: Vec<i64>,
    progress: HashMap<i64, TaskProgress>,
    completed: bool,
    last_touched: Instant,
}

/// Tracks named groups of tasks and their rolled-up progress.
pub struct BatchAggregator {
    config: BatchConfig,
    batches: HashMap<String, BatchState>,
}

impl BatchAggregator {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            batches: HashMap::new(),
        }
    }

    /// Registers a new batch with its member task ids. No-ops if the name
    /// is already in use.
    pub fn create_batch(&mut self, name: &str, member_ids: Vec<i64>) {
        self.batches.entry(name.to_string()).or_insert(BatchState {
            member_ids,
            progress: HashMap::new(),
            completed: false,
            last_touched: Instant::now(),
        });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.batches.contains_key(name)
    }

    /// Adds `task_id` to an existing batch's membership, for batches whose
    /// tasks are submitted one at a time rather than all at once. No-ops if
    /// the batch doesn't exist or already contains the id.
    pub fn add_member(&mut self, name: &str, task_id: i64) -> bool {
        match self.batches.get_mut(name) {
            Some(batch) if !batch.member_ids.contains(&task_id) => {
                batch.member_ids.push(task_id);
                true
            }
            _ => false,
        }
    }

    /// Records a member task's latest progress and recomputes the batch's
    /// rollup. Returns `Some(progress)` plus whether this update is the
    /// batch's completion edge (fires exactly once).
    pub fn update_task(
        &mut self,
        name: &str,
        task_id: i64,
        progress: TaskProgress,
    ) -> Option<(BatchProgress, bool)> {
        let batch = self.batches.get_mut(name)?;
        if !batch.member_ids.contains(&task_id) {
            return None;
        }
        batch.progress.insert(task_id, progress);
        batch.last_touched = Instant::now();

        let rollup = Self::rollup(batch);
        let just_completed = !batch.completed && rollup.completed_tasks == rollup.total_tasks;
        if just_completed {
            batch.completed = true;
        }
        Some((rollup, just_completed))
    }

    fn rollup(batch: &BatchState) -> BatchProgress {
        let total_tasks = batch.member_ids.len();
        if total_tasks == 0 {
            return BatchProgress {
                percent: 1.0,
                total_tasks: 0,
                ..Default::default()
            };
        }

        let entries: Vec<TaskProgress> = batch
            .member_ids
            .iter()
            .filter_map(|id| batch.progress.get(id).copied())
            .collect();

        let completed_tasks = entries
            .iter()
            .filter(|p| p.state == TaskState::Completed)
            .count();

        let known_total: Option<u64> = {
            let mut sum = 0u64;
            let mut all_known = !entries.is_empty();
            for p in &entries {
                match p.total_bytes {
                    Some(t) => sum = sum.saturating_add(t),
                    None => {
                        all_known = false;
                        break;
                    }
                }
            }
            if entries.len() < total_tasks {
                all_known = false;
            }
            all_known.then_some(sum)
        };

        let percent = match known_total {
            Some(total) if total > 0 => {
                let done: u64 = entries.iter().map(|p| p.bytes_done).sum();
                (done as f64 / total as f64).min(1.0)
            }
            _ => {
                if entries.is_empty() {
                    0.0
                } else {
                    entries.iter().map(|p| p.percent()).sum::<f64>() / total_tasks as f64
                }
            }
        };

        let combined_speed_bps: f64 = entries
            .iter()
            .filter(|p| p.is_active())
            .map(|p| p.bytes_per_sec)
            .sum();

        let eta = match known_total {
            Some(total) if combined_speed_bps > 0.0 => {
                let done: u64 = entries.iter().map(|p| p.bytes_done).sum();
                let remaining = total.saturating_sub(done);
                Some(Duration::from_secs_f64(remaining as f64 / combined_speed_bps))
            }
            _ => {
                let member_etas: Vec<f64> = entries
                    .iter()
                    .filter(|p| p.is_active() && p.bytes_per_sec > 0.0)
                    .filter_map(|p| match p.total_bytes {
                        Some(total) => {
                            let remaining = total.saturating_sub(p.bytes_done);
                            Some(remaining as f64 / p.bytes_per_sec)
                        }
                        None => None,
                    })
                    .collect();
                if member_etas.is_empty() {
                    None
                } else {
                    let mean = member_etas.iter().sum::<f64>() / member_etas.len() as f64;
                    Some(Duration::from_secs_f64(mean.max(0.0)))
                }
            }
        };

        BatchProgress {
            percent,
            combined_speed_bps,
            completed_tasks,
            total_tasks,
            eta,
        }
    }

    pub fn progress(&self, name: &str) -> Option<BatchProgress> {
        self.batches.get(name).map(Self::rollup)
    }

    pub fn remove(&mut self, name: &str) {
        self.batches.remove(name);
    }

    /// Drops batches untouched for longer than `stale_after`, as the
    /// periodic GC sweep (§4.10, every `gc_interval`).
    pub fn gc_stale(&mut self) {
        let stale_after = self.config.stale_after.as_duration();
        let now = Instant::now();
        self.batches
            .retain(|_, batch| now.duration_since(batch.last_touched) < stale_after);
    }

    pub fn gc_interval(&self) -> Duration {
        self.config.gc_interval.as_duration()
    }
}

/// Runs the periodic stale-batch GC sweep. Intended to be spawned with
/// `tokio::spawn` alongside the scheduler.
pub async fn run_gc_loop(aggregator: std::sync::Arc<tokio::sync::Mutex<BatchAggregator>>) {
    loop {
        let interval = aggregator.lock().await.gc_interval();
        tokio::time::sleep(interval).await;
        aggregator.lock().await.gc_stale();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(state: TaskState, bytes_done: u64, total_bytes: Option<u64>, bps: f64) -> TaskProgress {
        TaskProgress {
            state,
            bytes_done,
            total_bytes,
            bytes_per_sec: bps,
        }
    }

    #[test]
    fn byte_weighted_rollup_when_all_totals_known() {
        let mut agg = BatchAggregator::new(BatchConfig::default());
        agg.create_batch("season1", vec![1, 2]);

        agg.update_task("season1", 1, progress(TaskState::Running, 50, Some(100), 10.0));
        let (rollup, completed) =
            agg.update_task("season1", 2, progress(TaskState::Running, 25, Some(100), 5.0)).unwrap();

        assert!(!completed);
        assert!((rollup.percent - 0.375).abs() < 1e-9);
        assert!((rollup.combined_speed_bps - 15.0).abs() < 1e-9);
    }

    #[test]
    fn falls_back_to_percentage_mean_when_a_total_is_unknown() {
        let mut agg = BatchAggregator::new(BatchConfig::default());
        agg.create_batch("mixed", vec![1, 2]);
        agg.update_task("mixed", 1, progress(TaskState::Running, 50, Some(100), 10.0));
        let (rollup, _) =
            agg.update_task("mixed", 2, progress(TaskState::Running, 0, None, 0.0)).unwrap();

        // member 1 is 50% done, member 2 has no known total and isn't
        // complete, so its percent is 0: mean is 0.25.
        assert!((rollup.percent - 0.25).abs() < 1e-9);
    }

    #[test]
    fn completion_fires_exactly_once() {
        let mut agg = BatchAggregator::new(BatchConfig::default());
        agg.create_batch("solo", vec![1]);

        let (_, first) =
            agg.update_task("solo", 1, progress(TaskState::Completed, 100, Some(100), 0.0)).unwrap();
        assert!(first);

        let (_, second) =
            agg.update_task("solo", 1, progress(TaskState::Completed, 100, Some(100), 0.0)).unwrap();
        assert!(!second);
    }

    #[test]
    fn update_for_unknown_member_is_ignored() {
        let mut agg = BatchAggregator::new(BatchConfig::default());
        agg.create_batch("known", vec![1]);
        assert!(agg
            .update_task("known", 999, progress(TaskState::Running, 1, Some(10), 1.0))
            .is_none());
    }

    #[test]
    fn add_member_extends_an_existing_batch() {
        let mut agg = BatchAggregator::new(BatchConfig::default());
        agg.create_batch("season1", vec![1]);
        assert!(agg.add_member("season1", 2));
        assert!(!agg.add_member("season1", 2));
        assert!(!agg.add_member("no-such-batch", 3));
        assert_eq!(agg.progress("season1").unwrap().total_tasks, 2);
    }

    #[test]
    fn gc_stale_drops_untouched_batches() {
        let config = BatchConfig {
            stale_after: crate::config::DurationSecs::secs(0),
            ..BatchConfig::default()
        };
        let mut agg = BatchAggregator::new(config);
        agg.create_batch("old", vec![1]);
        std::thread::sleep(Duration::from_millis(5));
        agg.gc_stale();
        assert!(!agg.contains("old"));
    }

    #[test]
    fn empty_batch_is_immediately_complete() {
        let mut agg = BatchAggregator::new(BatchConfig::default());
        agg.create_batch("empty", vec![]);
        let rollup = agg.progress("empty").unwrap();
        assert_eq!(rollup.total_tasks, 0);
        assert!((rollup.percent - 1.0).abs() < 1e-9);
    }
}

//! `Engine` (§6, §9): the single owning context every subsystem hangs off
//! of, constructed once per process and passed around by `Arc` reference
//! rather than reached for through process-global state.
//!
//! This is the orchestration layer the rest of `ddm-core` deliberately
//! doesn't provide on its own: `hls::run_segment_executor` knows how to run
//! one download, `prioritize::QueueScheduler` knows how to pick the next
//! admissible task, `task::TaskStateMachine` knows the legal lifecycle — but
//! nothing wires submission, admission, execution and history together
//! except this module. It exposes exactly the external surface §6 describes
//! (submit/cancel/pause/resume/remove/set_priority/reorder plus progress,
//! state and optimization-hint subscriptions).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, Mutex};

use crate::bandwidth::{BandwidthMonitor, OptimizationHint};
use crate::batch::{run_gc_loop, BatchAggregator, BatchProgress, TaskProgress};
use crate::config::DdmConfig;
use crate::connection_pool::ConnectionPool;
use crate::eta::{EtaAlgorithm, EtaCalculator, EtaEstimate, ProgressSample};
use crate::history::{HistoryRecord, HistoryStore, TerminalStatus};
use crate::hls::{
    run_segment_executor, ExecutorContext, ExecutorError, HlsJobSpec, JobControlToken, JobOutcome,
};
use crate::host_policy::CircuitBreakerRegistry;
use crate::prioritize::{
    FactorScores, PrioritizationEngine, QueueScheduler, ResourceLoad, SchedulingStrategy,
    TaskFactorInputs,
};
use crate::retry::CategoryPolicyTable;
use crate::task::{TaskEvent, TaskState, TaskStateMachine, TaskStatus, TransitionError};

/// One caller-declared download (§3's input surface, as consumed by §6).
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: Option<String>,
    pub source_url: String,
    pub output_path: PathBuf,
    pub declared_size_bytes: Option<u64>,
    /// 1 (most urgent) .. 5 (least urgent).
    pub priority: u8,
    pub deadline_unix: Option<i64>,
    pub depends_on: HashSet<i64>,
    pub metadata: HashMap<String, String>,
    /// Name of a batch this task should roll up into, if any.
    pub batch: Option<String>,
}

impl TaskSpec {
    pub fn new(source_url: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            name: None,
            source_url: source_url.into(),
            output_path: output_path.into(),
            declared_size_bytes: None,
            priority: 3,
            deadline_unix: None,
            depends_on: HashSet::new(),
            metadata: HashMap::new(),
            batch: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("task {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// One segment-completion update, relayed to every `subscribe_progress`
/// receiver (§6).
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub task_id: i64,
    pub bytes_done: u64,
    pub total_bytes: Option<u64>,
    pub bytes_per_sec: f64,
}

/// Everything the engine needs to remember about one live task beyond what
/// the state machine and queue already track.
struct TaskRuntime {
    spec: TaskSpec,
    control: JobControlToken,
    factors: FactorScores,
    started_unix: i64,
    eta: EtaCalculator,
    last_bytes: u64,
    last_sample_at: Option<Instant>,
}

/// Single engine context (§9): every subsystem is a plain field, constructed
/// once in `Engine::new` and shared by reference, in place of the teacher's
/// module-level globals (`scheduler::budget`'s process-wide semaphore,
/// `host_policy`'s ambient cache).
pub struct Engine {
    config: DdmConfig,
    scratch_root: PathBuf,
    state_machine: Arc<TaskStateMachine>,
    queue: Mutex<QueueScheduler>,
    prioritization: Mutex<PrioritizationEngine>,
    executor_ctx: Arc<ExecutorContext>,
    batch: Arc<Mutex<BatchAggregator>>,
    history: Option<HistoryStore>,
    runtimes: Mutex<HashMap<i64, TaskRuntime>>,
    task_batch: Mutex<HashMap<i64, String>>,
    next_id: AtomicI64,
    progress_tx: broadcast::Sender<ProgressEvent>,
    optimization_tx: broadcast::Sender<OptimizationHint>,
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl Engine {
    pub fn new(
        config: DdmConfig,
        scratch_root: PathBuf,
        strategy: SchedulingStrategy,
        history: Option<HistoryStore>,
    ) -> Arc<Self> {
        let state_machine = Arc::new(TaskStateMachine::new());

        let pool_config = crate::connection_pool::ConnectionPoolConfig {
            max_connections_per_host: config.connection_pool.max_connections_per_host,
            max_idle_per_host: config.connection_pool.max_idle_per_host,
            connect_timeout: config.connection_pool.connect_timeout.into(),
            read_timeout: config.connection_pool.read_timeout.into(),
            keep_alive_timeout: config.connection_pool.keep_alive_timeout.into(),
            health_check_interval: config.connection_pool.health_check_interval.into(),
        };
        let connection_pool = Arc::new(ConnectionPool::new(config.max_total_connections, pool_config));

        let executor_ctx = Arc::new(ExecutorContext {
            connection_pool,
            circuit_breakers: Arc::new(std::sync::Mutex::new(CircuitBreakerRegistry::new())),
            retry_policies: CategoryPolicyTable::with_jitter_fraction(config.retry.jitter_fraction),
            key_cache: Arc::new(crate::hls::KeyCache::new()),
            state_machine: Arc::clone(&state_machine),
        });

        let queue = Mutex::new(QueueScheduler::new(strategy, config.scheduler.max_concurrent_tasks));
        let prioritization = Mutex::new(PrioritizationEngine::new(&config.prioritization));
        let batch = Arc::new(Mutex::new(BatchAggregator::new(config.batch.clone())));
        let (progress_tx, _) = broadcast::channel(1024);
        let (optimization_tx, _) = broadcast::channel(64);

        Arc::new(Self {
            config,
            scratch_root,
            state_machine,
            queue,
            prioritization,
            executor_ctx,
            batch,
            history,
            runtimes: Mutex::new(HashMap::new()),
            task_batch: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            progress_tx,
            optimization_tx,
        })
    }

    /// Registers a new task, assigns it an id, scores it and enqueues it for
    /// admission. The task starts in `Queued`; nothing is dispatched until a
    /// subsequent `run_admission_tick`.
    pub async fn submit(&self, spec: TaskSpec) -> Result<i64, EngineError> {
        let task_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state_machine.register(task_id);
        self.state_machine.transition(task_id, TaskState::Queued, false)?;

        let inputs = TaskFactorInputs {
            file_size_bytes: spec.declared_size_bytes.unwrap_or(0),
            user_priority: spec.priority,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            resource_intensity: 0.5,
            historical_success_rate: None,
            seconds_until_deadline: spec.deadline_unix.map(|d| (d - unix_now()) as f64),
            age_hours: 0.0,
            dependent_task_count: 0,
            available_bandwidth_bps: None,
            required_bandwidth_bps: None,
        };
        let factors = self.prioritization.lock().await.score(&inputs).factors;

        self.queue
            .lock()
            .await
            .enqueue_with_dependencies(task_id, inputs, spec.depends_on.clone());

        if let Some(name) = spec.batch.clone() {
            let mut batch = self.batch.lock().await;
            if batch.contains(&name) {
                batch.add_member(&name, task_id);
            } else {
                batch.create_batch(&name, vec![task_id]);
            }
            drop(batch);
            self.task_batch.lock().await.insert(task_id, name);
        }

        self.runtimes.lock().await.insert(
            task_id,
            TaskRuntime {
                spec,
                control: JobControlToken::new(),
                factors,
                started_unix: unix_now(),
                eta: EtaCalculator::new(self.config.eta.ring_capacity),
                last_bytes: 0,
                last_sample_at: None,
            },
        );

        Ok(task_id)
    }

    /// Cancels `task_id`: cooperatively signals an in-flight job, or pulls it
    /// straight out of the pending queue if it hasn't started yet.
    pub async fn cancel(&self, task_id: i64) -> Result<(), EngineError> {
        let status = self
            .state_machine
            .status(task_id)
            .ok_or(EngineError::NotFound(task_id))?;
        if status.state.is_terminal() {
            return Ok(());
        }
        if matches!(
            status.state,
            TaskState::Running | TaskState::Retrying | TaskState::Paused | TaskState::Pausing | TaskState::Resuming
        ) {
            if let Some(runtime) = self.runtimes.lock().await.get(&task_id) {
                runtime.control.request_cancel();
            }
            return Ok(());
        }
        self.queue.lock().await.remove_pending(task_id);
        self.state_machine.transition(task_id, TaskState::Canceled, true)?;
        Ok(())
    }

    /// Requests a running task pause at the next segment boundary. The
    /// segment executor itself drives `Pausing -> Paused`.
    pub async fn pause(&self, task_id: i64) -> Result<(), EngineError> {
        self.runtimes
            .lock()
            .await
            .get(&task_id)
            .ok_or(EngineError::NotFound(task_id))?
            .control
            .request_pause();
        Ok(())
    }

    /// Resumes a paused task with a fresh control token, re-dispatching it
    /// through the same admission path a freshly-submitted task takes.
    pub async fn resume(self: &Arc<Self>, task_id: i64) -> Result<(), EngineError> {
        let status = self
            .state_machine
            .status(task_id)
            .ok_or(EngineError::NotFound(task_id))?;
        if status.state != TaskState::Paused {
            return Ok(());
        }
        self.state_machine.transition(task_id, TaskState::Resuming, false)?;

        {
            let mut runtimes = self.runtimes.lock().await;
            if let Some(runtime) = runtimes.get_mut(&task_id) {
                runtime.control = JobControlToken::new();
            }
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.drive_task(task_id).await });
        Ok(())
    }

    /// Drops a task entirely: cancels it if running, then forgets it.
    pub async fn remove(&self, task_id: i64) -> Result<(), EngineError> {
        if let Some(status) = self.state_machine.status(task_id) {
            if matches!(status.state, TaskState::Running | TaskState::Retrying) {
                if let Some(runtime) = self.runtimes.lock().await.get(&task_id) {
                    runtime.control.request_cancel();
                }
            }
        }
        self.queue.lock().await.remove_pending(task_id);
        self.runtimes.lock().await.remove(&task_id);
        self.task_batch.lock().await.remove(&task_id);
        self.state_machine.remove(task_id);
        Ok(())
    }

    /// `set_priority(task_id, priority)` (§6).
    pub async fn set_priority(&self, task_id: i64, priority: u8) -> bool {
        if let Some(runtime) = self.runtimes.lock().await.get_mut(&task_id) {
            runtime.spec.priority = priority;
        }
        self.queue.lock().await.set_priority(task_id, priority)
    }

    /// `reorder(pending_order)` (§6).
    pub async fn reorder(&self, order: &[i64]) {
        self.queue.lock().await.reorder(order);
    }

    pub fn status(&self, task_id: i64) -> Option<TaskStatus> {
        self.state_machine.status(task_id)
    }

    /// Per-task ETA against the algorithm of the caller's choosing, `None`
    /// when the task isn't tracked or has no declared size.
    pub async fn eta(&self, task_id: i64, algorithm: EtaAlgorithm) -> Option<EtaEstimate> {
        let runtimes = self.runtimes.lock().await;
        let runtime = runtimes.get(&task_id)?;
        let total = runtime.spec.declared_size_bytes?;
        Some(runtime.eta.estimate(algorithm, total))
    }

    pub async fn create_batch(&self, name: &str, member_ids: Vec<i64>) {
        self.batch.lock().await.create_batch(name, member_ids.clone());
        let mut task_batch = self.task_batch.lock().await;
        for id in member_ids {
            task_batch.insert(id, name.to_string());
        }
    }

    pub async fn batch_progress(&self, name: &str) -> Option<BatchProgress> {
        self.batch.lock().await.progress(name)
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<TaskEvent> {
        self.state_machine.subscribe()
    }

    pub fn subscribe_optimization_hints(&self) -> broadcast::Receiver<OptimizationHint> {
        self.optimization_tx.subscribe()
    }

    /// Forces any transitional-state task stuck past the 30s timeout to
    /// `Failed` (§4.4). Intended to be called on a periodic tick alongside
    /// `run_admission_tick`.
    pub fn sweep_timeouts(&self) -> Vec<i64> {
        self.state_machine.sweep_timeouts()
    }

    /// Admits as many pending, dependency-satisfied tasks as the configured
    /// strategy and `load` currently allow, dispatching each on its own
    /// task.
    pub async fn run_admission_tick(self: &Arc<Self>, load: ResourceLoad) {
        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                let prioritization = self.prioritization.lock().await;
                queue.admit_next_under_load(&prioritization, load)
            };
            let Some(task_id) = next else { break };
            let engine = Arc::clone(self);
            tokio::spawn(async move { engine.drive_task(task_id).await });
        }
    }

    /// Runs one admitted task to completion (or pause/cancel), relaying
    /// progress and finalizing queue/history/prioritization bookkeeping
    /// afterward.
    async fn drive_task(self: Arc<Self>, task_id: i64) {
        let (spec, control) = {
            let runtimes = self.runtimes.lock().await;
            let Some(runtime) = runtimes.get(&task_id) else {
                return;
            };
            (runtime.spec.clone(), runtime.control.clone())
        };

        if self.state_machine.status(task_id).map(|s| s.state) == Some(TaskState::Queued) {
            let _ = self.state_machine.transition(task_id, TaskState::Preparing, false);
        }

        let scratch_dir = self.scratch_root.join(task_id.to_string());
        let job_spec = HlsJobSpec {
            task_id,
            source_url: spec.source_url.clone(),
            output_path: spec.output_path.clone(),
            scratch_dir,
            per_task_parallelism: self.config.scheduler.per_task_parallelism,
        };

        let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressSample>(64);
        let relay_engine = Arc::clone(&self);
        let relay_handle = tokio::spawn(async move {
            while let Some(sample) = progress_rx.recv().await {
                relay_engine.on_progress_sample(task_id, sample).await;
            }
        });

        let outcome =
            run_segment_executor(job_spec, Arc::clone(&self.executor_ctx), control, Some(progress_tx)).await;
        let _ = relay_handle.await;

        self.finalize_task(task_id, outcome).await;
    }

    async fn on_progress_sample(&self, task_id: i64, sample: ProgressSample) {
        let (bytes_per_sec, total_bytes) = {
            let mut runtimes = self.runtimes.lock().await;
            let Some(runtime) = runtimes.get_mut(&task_id) else {
                return;
            };
            runtime.eta.record(sample.bytes_done);
            let bytes_per_sec = match runtime.last_sample_at {
                Some(prev_at) => {
                    let dt = sample.at.duration_since(prev_at).as_secs_f64().max(f64::EPSILON);
                    (sample.bytes_done.saturating_sub(runtime.last_bytes)) as f64 / dt
                }
                None => 0.0,
            };
            runtime.last_bytes = sample.bytes_done;
            runtime.last_sample_at = Some(sample.at);
            (bytes_per_sec, runtime.spec.declared_size_bytes)
        };

        let _ = self.progress_tx.send(ProgressEvent {
            task_id,
            bytes_done: sample.bytes_done,
            total_bytes,
            bytes_per_sec,
        });

        let batch_name = self.task_batch.lock().await.get(&task_id).cloned();
        if let Some(batch_name) = batch_name {
            let state = self
                .state_machine
                .status(task_id)
                .map(|s| s.state)
                .unwrap_or(TaskState::Running);
            let progress = TaskProgress {
                state,
                bytes_done: sample.bytes_done,
                total_bytes,
                bytes_per_sec,
            };
            self.batch.lock().await.update_task(&batch_name, task_id, progress);
        }
    }

    async fn finalize_task(&self, task_id: i64, outcome: Result<JobOutcome, ExecutorError>) {
        let Some((spec, factors, started_unix)) = ({
            let runtimes = self.runtimes.lock().await;
            runtimes
                .get(&task_id)
                .map(|r| (r.spec.clone(), r.factors, r.started_unix))
        }) else {
            return;
        };

        let terminal_status = match &outcome {
            Ok(JobOutcome::Completed { .. }) => Some(TerminalStatus::Completed),
            Ok(JobOutcome::Canceled) => Some(TerminalStatus::Canceled),
            // Paused tasks aren't terminal; they wait for `resume`.
            Ok(JobOutcome::Paused { .. }) => None,
            Err(_) => Some(TerminalStatus::Failed),
        };

        // §4.4: a segment/playlist failure must still drive `Running`/
        // `Preparing -> Failed` (effects: increments `error_count`, records
        // the reason) even though only the assembly-error path inside
        // `run_segment_executor` transitions the state machine itself.
        // Forced because the failing state may be `Preparing` (a playlist
        // parse error, before the executor ever reaches `Running`) as well
        // as `Running`; skip it if the executor already transitioned (e.g.
        // the assembly-error path) so this doesn't double-count
        // `error_count`.
        if let Err(err) = &outcome {
            let already_failed = self
                .state_machine
                .status(task_id)
                .map(|s| s.state == TaskState::Failed)
                .unwrap_or(true);
            if !already_failed {
                let _ = self.state_machine.transition(task_id, TaskState::Failed, true);
            }
            tracing::warn!(task_id, error = %err, "task failed");
        }

        {
            let mut queue = self.queue.lock().await;
            match terminal_status {
                Some(TerminalStatus::Completed) => queue.mark_completed(task_id),
                Some(_) => queue.mark_failed(task_id),
                None => {}
            }
        }

        if let Some(status) = terminal_status {
            let succeeded = matches!(status, TerminalStatus::Completed);
            self.prioritization.lock().await.record_outcome(&factors, succeeded);

            if let Some(history) = &self.history {
                let (final_size_bytes, segments_completed) = match &outcome {
                    Ok(JobOutcome::Completed { bytes_written, segments_completed }) => {
                        (*bytes_written as i64, *segments_completed as i64)
                    }
                    Ok(JobOutcome::Canceled) => (0, 0),
                    Ok(JobOutcome::Paused { segments_completed }) => (0, *segments_completed as i64),
                    Err(_) => (0, 0),
                };
                let retry_count = self
                    .state_machine
                    .status(task_id)
                    .map(|s| s.retry_count as i64)
                    .unwrap_or(0);
                let record = HistoryRecord {
                    id: 0,
                    task_name: spec.name.clone().unwrap_or_else(|| spec.source_url.clone()),
                    url: spec.source_url.clone(),
                    output_path: spec.output_path.display().to_string(),
                    final_size_bytes,
                    status,
                    start_time_unix: started_unix,
                    end_time_unix: unix_now(),
                    average_speed_bps: 0.0,
                    peak_speed_bps: 0.0,
                    segments_declared: segments_completed,
                    segments_completed,
                    retry_count,
                    error_message: outcome.as_ref().err().map(|e| e.to_string()),
                    metadata: spec.metadata.clone(),
                    tags: Vec::new(),
                };
                let _ = history.append(&record).await;
            }
        }

        if !matches!(outcome, Ok(JobOutcome::Paused { .. })) {
            self.runtimes.lock().await.remove(&task_id);
        }
    }

    /// Spawns the periodic stale-batch GC sweep (§4.10) alongside the engine.
    pub fn spawn_batch_gc(self: &Arc<Self>) {
        tokio::spawn(run_gc_loop(Arc::clone(&self.batch)));
    }

    /// Spawns the periodic admission tick (§4.7, default 5s) that also
    /// drives the transitional-state timeout sweep (§4.4). `network_pct`
    /// feeds `ResourceAware` alongside the real CPU/memory sample from
    /// `system_load`; network utilization is supplied by whoever is already
    /// running `spawn_bandwidth_monitor`, if any.
    pub fn spawn_scheduler_loop(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut sampler = crate::system_load::SystemLoadSampler::new();
            let tick_interval = engine.config.scheduler.tick_interval.into();
            loop {
                tokio::time::sleep(tick_interval).await;
                let system = sampler.sample().unwrap_or_default();
                let load = ResourceLoad {
                    cpu_pct: system.cpu_pct,
                    memory_pct: system.memory_pct,
                    network_pct: 0.0,
                };
                engine.run_admission_tick(load).await;
                for task_id in engine.sweep_timeouts() {
                    tracing::warn!(task_id, "transitional state timed out; forced to Failed");
                }
            }
        });
    }

    /// Spawns a bandwidth sampling loop (§4.9) that republishes derived
    /// optimization hints on `subscribe_optimization_hints`.
    pub fn spawn_bandwidth_monitor(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut monitor = BandwidthMonitor::new(engine.config.bandwidth.clone());
            let sample_interval = monitor.sample_interval();
            let hint_interval = monitor.hint_interval();
            let mut since_last_hint = std::time::Duration::ZERO;
            loop {
                tokio::time::sleep(sample_interval).await;
                if monitor.sample().is_err() {
                    continue;
                }
                since_last_hint += sample_interval;
                if since_last_hint >= hint_interval {
                    since_last_hint = std::time::Duration::ZERO;
                    let active = engine.queue.lock().await.running_count();
                    for hint in monitor.optimization_hints(active) {
                        let _ = engine.optimization_tx.send(hint);
                    }
                }
            }
        });
    }
}

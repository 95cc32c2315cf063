//! `TaskStateMachine` (§4.4): tracks state per task id, enforces the
//! transition table, sweeps stuck transitional states, and notifies
//! subscribers.
//!
//! Callbacks in the original design could fail and crash the driving loop;
//! here a subscriber instead holds a `tokio::sync::broadcast::Receiver` and
//! drops it to unsubscribe. The machine never blocks on a slow or gone
//! subscriber: `broadcast` drops the oldest buffered event instead.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use super::state::TaskState;

const TRANSITIONAL_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub task_id: i64,
    pub from: TaskState,
    pub to: TaskState,
    pub forced: bool,
}

#[derive(Debug)]
pub struct TransitionError {
    pub task_id: i64,
    pub from: TaskState,
    pub to: TaskState,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {}: illegal transition {:?} -> {:?}",
            self.task_id, self.from, self.to
        )
    }
}

impl std::error::Error for TransitionError {}

struct TaskRecord {
    state: TaskState,
    entered_at: Instant,
    retry_count: u32,
    error_count: u32,
    last_error: Option<String>,
}

impl TaskRecord {
    fn new() -> Self {
        Self {
            state: TaskState::Created,
            entered_at: Instant::now(),
            retry_count: 0,
            error_count: 0,
            last_error: None,
        }
    }
}

/// Snapshot returned to callers that just need current status, without
/// holding the machine's lock.
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub state: TaskState,
    pub retry_count: u32,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub time_in_state: Duration,
}

pub struct TaskStateMachine {
    tasks: Mutex<HashMap<i64, TaskRecord>>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskStateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tasks: Mutex::new(HashMap::new()),
            events: tx,
        }
    }

    /// A fresh, independently-droppable subscription to task transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn register(&self, task_id: i64) {
        self.tasks.lock().unwrap().entry(task_id).or_insert_with(TaskRecord::new);
    }

    pub fn status(&self, task_id: i64) -> Option<TaskStatus> {
        let tasks = self.tasks.lock().unwrap();
        tasks.get(&task_id).map(|r| TaskStatus {
            state: r.state,
            retry_count: r.retry_count,
            error_count: r.error_count,
            last_error: r.last_error.clone(),
            time_in_state: r.entered_at.elapsed(),
        })
    }

    /// Attempt a transition, enforcing the table unless `force` is set.
    /// Forced illegal transitions are logged at `warn` and still recorded.
    pub fn transition(&self, task_id: i64, to: TaskState, force: bool) -> Result<(), TransitionError> {
        let mut tasks = self.tasks.lock().unwrap();
        let record = tasks.entry(task_id).or_insert_with(TaskRecord::new);
        let from = record.state;

        if !from.can_transition_to(to) {
            if !force {
                return Err(TransitionError { task_id, from, to });
            }
            tracing::warn!(task_id, ?from, ?to, "forced illegal task state transition");
        }

        apply_effects(record, from, to);
        record.state = to;
        record.entered_at = Instant::now();
        drop(tasks);

        // A full broadcast channel with no subscribers errors; that's fine,
        // it just means nobody is currently listening.
        let _ = self.events.send(TaskEvent {
            task_id,
            from,
            to,
            forced: !from.can_transition_to(to),
        });
        Ok(())
    }

    pub fn record_error(&self, task_id: i64, message: impl Into<String>) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(record) = tasks.get_mut(&task_id) {
            record.error_count = record.error_count.saturating_add(1);
            record.last_error = Some(message.into());
        }
    }

    /// Scan for transitional-state tasks stuck past `TRANSITIONAL_TIMEOUT`
    /// and force them to `Failed`. Returns the affected task ids.
    pub fn sweep_timeouts(&self) -> Vec<i64> {
        let mut swept = Vec::new();
        let stuck_ids: Vec<i64> = {
            let tasks = self.tasks.lock().unwrap();
            tasks
                .iter()
                .filter(|(_, r)| r.state.is_transitional() && r.entered_at.elapsed() >= TRANSITIONAL_TIMEOUT)
                .map(|(id, _)| *id)
                .collect()
        };
        for task_id in stuck_ids {
            tracing::warn!(task_id, "task stuck in transitional state, forcing to Failed");
            if self.transition(task_id, TaskState::Failed, true).is_ok() {
                self.record_error(task_id, "transitional state timed out after 30s");
                swept.push(task_id);
            }
        }
        swept
    }

    pub fn remove(&self, task_id: i64) {
        self.tasks.lock().unwrap().remove(&task_id);
    }
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Side effects tied to specific transitions (§4.4: retry_count++,
/// error_count++, clear last_error on a fresh attempt).
fn apply_effects(record: &mut TaskRecord, from: TaskState, to: TaskState) {
    use TaskState::*;
    match (from, to) {
        (_, Retrying) => {
            record.retry_count = record.retry_count.saturating_add(1);
        }
        (_, Completed) => {
            record.last_error = None;
        }
        (_, Failed) => {
            record.error_count = record.error_count.saturating_add(1);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transition_updates_state_and_broadcasts() {
        let machine = TaskStateMachine::new();
        machine.register(1);
        let mut rx = machine.subscribe();
        machine.transition(1, TaskState::Queued, false).unwrap();
        let status = machine.status(1).unwrap();
        assert_eq!(status.state, TaskState::Queued);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.to, TaskState::Queued);
        assert!(!event.forced);
    }

    #[test]
    fn illegal_transition_rejected_without_force() {
        let machine = TaskStateMachine::new();
        machine.register(1);
        let err = machine.transition(1, TaskState::Running, false).unwrap_err();
        assert_eq!(err.from, TaskState::Created);
        assert_eq!(err.to, TaskState::Running);
    }

    #[test]
    fn forced_illegal_transition_succeeds_and_is_flagged() {
        let machine = TaskStateMachine::new();
        machine.register(1);
        machine.transition(1, TaskState::Running, true).unwrap();
        assert_eq!(machine.status(1).unwrap().state, TaskState::Running);
    }

    #[test]
    fn retry_count_increments_on_running_to_retrying() {
        let machine = TaskStateMachine::new();
        machine.register(1);
        machine.transition(1, TaskState::Queued, false).unwrap();
        machine.transition(1, TaskState::Preparing, false).unwrap();
        machine.transition(1, TaskState::Running, false).unwrap();
        machine.transition(1, TaskState::Retrying, false).unwrap();
        assert_eq!(machine.status(1).unwrap().retry_count, 1);
    }

    #[test]
    fn failed_increments_error_count() {
        let machine = TaskStateMachine::new();
        machine.register(1);
        machine.transition(1, TaskState::Queued, false).unwrap();
        machine.transition(1, TaskState::Preparing, false).unwrap();
        machine.transition(1, TaskState::Failed, false).unwrap();
        assert_eq!(machine.status(1).unwrap().error_count, 1);
    }

    #[test]
    fn dropping_subscription_does_not_affect_others() {
        let machine = TaskStateMachine::new();
        machine.register(1);
        let rx1 = machine.subscribe();
        drop(rx1);
        let mut rx2 = machine.subscribe();
        machine.transition(1, TaskState::Queued, false).unwrap();
        assert!(rx2.try_recv().is_ok());
    }
}

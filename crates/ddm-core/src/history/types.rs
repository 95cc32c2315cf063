//! Types stored by and queried from the history store (§3 `HistoryRecord`).

use std::collections::HashMap;

/// Final outcome of a terminal task, as recorded in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Completed,
    Failed,
    Canceled,
    /// Completed with some segments missing (e.g. a forced finish); distinct
    /// from `Failed` because partial output was still produced.
    Partial,
}

impl TerminalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalStatus::Completed => "completed",
            TerminalStatus::Failed => "failed",
            TerminalStatus::Canceled => "canceled",
            TerminalStatus::Partial => "partial",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "completed" => TerminalStatus::Completed,
            "canceled" => TerminalStatus::Canceled,
            "partial" => TerminalStatus::Partial,
            _ => TerminalStatus::Failed,
        }
    }
}

/// Immutable snapshot appended on a task's terminal transition (§3).
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    /// Row id; `0` when not yet persisted (assigned by `HistoryStore::append`).
    pub id: i64,
    pub task_name: String,
    pub url: String,
    pub output_path: String,
    pub final_size_bytes: i64,
    pub status: TerminalStatus,
    pub start_time_unix: i64,
    pub end_time_unix: i64,
    pub average_speed_bps: f64,
    pub peak_speed_bps: f64,
    pub segments_declared: i64,
    pub segments_completed: i64,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub metadata: HashMap<String, String>,
    pub tags: Vec<String>,
}

impl HistoryRecord {
    pub fn duration_secs(&self) -> i64 {
        (self.end_time_unix - self.start_time_unix).max(0)
    }
}

/// Filter predicate for `HistoryStore::query` (§6: "indexed on (status,
/// start_time, task_name, file_size)"). Every field is optional; `None`
/// skips that predicate.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub status: Option<TerminalStatus>,
    pub task_name_contains: Option<String>,
    pub start_time_after: Option<i64>,
    pub start_time_before: Option<i64>,
    pub min_file_size: Option<i64>,
    pub max_file_size: Option<i64>,
}

/// Sort key for `HistoryStore::query` results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySortKey {
    StartTimeDesc,
    StartTimeAsc,
    FileSizeDesc,
    TaskNameAsc,
}

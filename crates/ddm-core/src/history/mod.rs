//! `HistoryStore` (§4.11): append-only record of terminal downloads,
//! queryable by filter predicate and sort key.
//!
//! Interface-level per §1/§4.11 — the distilled spec calls this "the
//! trivial relational query", so it is wired up exactly the way
//! `resume_db::db::ResumeDb` already demonstrates: a thin wrapper around a
//! `Pool<Sqlite>`, one migration, parameterized queries. It shares the same
//! SQLite database file as the job/resume store rather than opening a
//! second one.

mod db;
mod types;

pub use db::HistoryStore;
pub use types::{HistoryFilter, HistoryRecord, HistorySortKey, TerminalStatus};

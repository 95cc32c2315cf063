//! SQLite-backed history store implementation.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, QueryBuilder, Row, Sqlite};

use super::types::{HistoryFilter, HistoryRecord, HistorySortKey, TerminalStatus};

/// Handle to the SQLite-backed history table.
///
/// Shares the same database file as `resume_db::ResumeDb`
/// (`~/.local/state/ddm/jobs.db`) rather than opening a second connection
/// pool, matching the teacher's one-database-per-process posture.
#[derive(Clone)]
pub struct HistoryStore {
    pool: Pool<Sqlite>,
}

impl HistoryStore {
    /// Wrap an already-open pool (e.g. `resume_db::ResumeDb`'s), running the
    /// history table's migration against it.
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open (or create) the default job database and run the history
    /// migration. Used by callers that don't already hold a `ResumeDb`.
    pub async fn open_default() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("ddm")?;
        let state_dir = xdg_dirs.get_state_home();
        let db_path = state_dir.join("jobs.db");
        tokio::fs::create_dir_all(&state_dir).await?;

        let uri = format!("sqlite://{}", db_path.display());
        let pool = SqlitePoolOptions::new().max_connections(8).connect(&uri).await?;
        Self::new(pool).await
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_name TEXT NOT NULL,
                url TEXT NOT NULL,
                output_path TEXT NOT NULL,
                final_size_bytes INTEGER NOT NULL,
                status TEXT NOT NULL,
                start_time_unix INTEGER NOT NULL,
                end_time_unix INTEGER NOT NULL,
                average_speed_bps REAL NOT NULL,
                peak_speed_bps REAL NOT NULL,
                segments_declared INTEGER NOT NULL,
                segments_completed INTEGER NOT NULL,
                retry_count INTEGER NOT NULL,
                error_message TEXT,
                metadata_json TEXT NOT NULL,
                tags_json TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS history_status_idx ON history(status);")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS history_start_time_idx ON history(start_time_unix);")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS history_task_name_idx ON history(task_name);")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS history_file_size_idx ON history(final_size_bytes);")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append an immutable record on a task's terminal transition. Returns
    /// the assigned row id.
    pub async fn append(&self, record: &HistoryRecord) -> Result<i64> {
        let metadata_json = serde_json::to_string(&record.metadata)?;
        let tags_json = serde_json::to_string(&record.tags)?;

        let id = sqlx::query(
            r#"
            INSERT INTO history (
                task_name, url, output_path, final_size_bytes, status,
                start_time_unix, end_time_unix, average_speed_bps, peak_speed_bps,
                segments_declared, segments_completed, retry_count, error_message,
                metadata_json, tags_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&record.task_name)
        .bind(&record.url)
        .bind(&record.output_path)
        .bind(record.final_size_bytes)
        .bind(record.status.as_str())
        .bind(record.start_time_unix)
        .bind(record.end_time_unix)
        .bind(record.average_speed_bps)
        .bind(record.peak_speed_bps)
        .bind(record.segments_declared)
        .bind(record.segments_completed)
        .bind(record.retry_count)
        .bind(&record.error_message)
        .bind(metadata_json)
        .bind(tags_json)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    /// Query history rows matching `filter`, ordered by `sort`.
    pub async fn query(&self, filter: &HistoryFilter, sort: HistorySortKey) -> Result<Vec<HistoryRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, task_name, url, output_path, final_size_bytes, status, \
             start_time_unix, end_time_unix, average_speed_bps, peak_speed_bps, \
             segments_declared, segments_completed, retry_count, error_message, \
             metadata_json, tags_json FROM history WHERE 1=1",
        );

        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(ref needle) = filter.task_name_contains {
            qb.push(" AND task_name LIKE ")
                .push_bind(format!("%{needle}%"));
        }
        if let Some(after) = filter.start_time_after {
            qb.push(" AND start_time_unix >= ").push_bind(after);
        }
        if let Some(before) = filter.start_time_before {
            qb.push(" AND start_time_unix <= ").push_bind(before);
        }
        if let Some(min) = filter.min_file_size {
            qb.push(" AND final_size_bytes >= ").push_bind(min);
        }
        if let Some(max) = filter.max_file_size {
            qb.push(" AND final_size_bytes <= ").push_bind(max);
        }

        qb.push(match sort {
            HistorySortKey::StartTimeDesc => " ORDER BY start_time_unix DESC",
            HistorySortKey::StartTimeAsc => " ORDER BY start_time_unix ASC",
            HistorySortKey::FileSizeDesc => " ORDER BY final_size_bytes DESC",
            HistorySortKey::TaskNameAsc => " ORDER BY task_name ASC",
        });

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata_json: String = row.get("metadata_json");
            let tags_json: String = row.get("tags_json");
            let metadata: HashMap<String, String> =
                serde_json::from_str(&metadata_json).unwrap_or_default();
            let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();

            out.push(HistoryRecord {
                id: row.get("id"),
                task_name: row.get("task_name"),
                url: row.get("url"),
                output_path: row.get("output_path"),
                final_size_bytes: row.get("final_size_bytes"),
                status: TerminalStatus::from_str(&row.get::<String, _>("status")),
                start_time_unix: row.get("start_time_unix"),
                end_time_unix: row.get("end_time_unix"),
                average_speed_bps: row.get("average_speed_bps"),
                peak_speed_bps: row.get("peak_speed_bps"),
                segments_declared: row.get("segments_declared"),
                segments_completed: row.get("segments_completed"),
                retry_count: row.get("retry_count"),
                error_message: row.get("error_message"),
                metadata,
                tags,
            });
        }
        Ok(out)
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM history")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_memory() -> HistoryStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        HistoryStore::new(pool).await.unwrap()
    }

    fn sample(task_name: &str, status: TerminalStatus, size: i64, start: i64) -> HistoryRecord {
        HistoryRecord {
            id: 0,
            task_name: task_name.to_string(),
            url: "https://h/playlist.m3u8".to_string(),
            output_path: "/tmp/out.ts".to_string(),
            final_size_bytes: size,
            status,
            start_time_unix: start,
            end_time_unix: start + 60,
            average_speed_bps: 1_000_000.0,
            peak_speed_bps: 2_000_000.0,
            segments_declared: 3,
            segments_completed: 3,
            retry_count: 0,
            error_message: None,
            metadata: HashMap::new(),
            tags: vec!["hls".to_string()],
        }
    }

    #[tokio::test]
    async fn append_then_query_round_trips_fields() {
        let store = open_memory().await;
        let record = sample("movie.mp4", TerminalStatus::Completed, 3_000_000, 1_000);
        let id = store.append(&record).await.unwrap();
        assert!(id > 0);

        let rows = store
            .query(&HistoryFilter::default(), HistorySortKey::StartTimeDesc)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task_name, "movie.mp4");
        assert_eq!(rows[0].status, TerminalStatus::Completed);
        assert_eq!(rows[0].tags, vec!["hls"]);
        assert_eq!(rows[0].duration_secs(), 60);
    }

    #[tokio::test]
    async fn filter_by_status_excludes_other_outcomes() {
        let store = open_memory().await;
        store
            .append(&sample("ok", TerminalStatus::Completed, 10, 1))
            .await
            .unwrap();
        store
            .append(&sample("bad", TerminalStatus::Failed, 10, 2))
            .await
            .unwrap();

        let filter = HistoryFilter {
            status: Some(TerminalStatus::Failed),
            ..Default::default()
        };
        let rows = store.query(&filter, HistorySortKey::StartTimeDesc).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task_name, "bad");
    }

    #[tokio::test]
    async fn sort_by_start_time_asc_orders_oldest_first() {
        let store = open_memory().await;
        store
            .append(&sample("second", TerminalStatus::Completed, 10, 200))
            .await
            .unwrap();
        store
            .append(&sample("first", TerminalStatus::Completed, 10, 100))
            .await
            .unwrap();

        let rows = store
            .query(&HistoryFilter::default(), HistorySortKey::StartTimeAsc)
            .await
            .unwrap();
        assert_eq!(rows[0].task_name, "first");
        assert_eq!(rows[1].task_name, "second");
    }

    #[tokio::test]
    async fn file_size_range_filter() {
        let store = open_memory().await;
        store
            .append(&sample("small", TerminalStatus::Completed, 100, 1))
            .await
            .unwrap();
        store
            .append(&sample("big", TerminalStatus::Completed, 1_000_000, 2))
            .await
            .unwrap();

        let filter = HistoryFilter {
            min_file_size: Some(1000),
            ..Default::default()
        };
        let rows = store.query(&filter, HistorySortKey::StartTimeDesc).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task_name, "big");
    }

    #[tokio::test]
    async fn count_reflects_appended_rows() {
        let store = open_memory().await;
        assert_eq!(store.count().await.unwrap(), 0);
        store
            .append(&sample("one", TerminalStatus::Completed, 1, 1))
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }
}

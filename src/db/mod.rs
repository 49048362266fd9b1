//! SQLite-backed storage for the analysis core.
//!
//! One connection behind an async mutex, WAL journal mode, prepared
//! statement cache. JSON payloads are stored as TEXT columns; timestamps
//! as RFC 3339 strings; analysis dates as ISO `YYYY-MM-DD`.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::models::{
    truncate_message, DailyCacheRow, OptionsHistoryInsert, StockHistoryInsert, TaskRecord,
    TaskStatus, TaskType, MAX_ERROR_LEN, MAX_STEP_LEN,
};

#[derive(Clone)]
pub struct AnalysisStore {
    conn: Arc<Mutex<Connection>>,
}

impl AnalysisStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open analysis db")?;
        Self::init_schema(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory analysis db")?;
        Self::init_schema(conn)
    }

    fn init_schema(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS analysis_tasks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 100,
                input_params TEXT NOT NULL,
                progress_percent INTEGER NOT NULL DEFAULT 0,
                current_step TEXT,
                result_data TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                related_history_id INTEGER,
                related_history_type TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_user ON analysis_tasks(user_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON analysis_tasks(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_created ON analysis_tasks(created_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS daily_analysis_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticker TEXT NOT NULL,
                style TEXT NOT NULL,
                analysis_date TEXT NOT NULL,
                full_analysis_data TEXT NOT NULL,
                source_task_id TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(ticker, style, analysis_date)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_daily_cache_lookup
             ON daily_analysis_cache(ticker, style, analysis_date)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS stock_analysis_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                ticker TEXT NOT NULL,
                style TEXT NOT NULL,
                current_price REAL,
                target_price REAL,
                stop_loss_price REAL,
                market_sentiment REAL,
                risk_score REAL,
                risk_level TEXT,
                position_size REAL,
                ev_score REAL,
                ev_weighted_pct REAL,
                recommendation_action TEXT,
                recommendation_confidence TEXT,
                ai_summary TEXT,
                full_analysis_data TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_stock_history_user_created
             ON stock_analysis_history(user_id, created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_stock_history_ticker
             ON stock_analysis_history(ticker)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS options_analysis_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                analysis_type TEXT NOT NULL,
                option_identifier TEXT,
                expiry_date TEXT,
                strike_price REAL,
                option_type TEXT,
                option_score REAL,
                iv_rank REAL,
                vrp_analysis TEXT,
                risk_analysis TEXT,
                ai_summary TEXT,
                full_analysis_data TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_options_history_user_created
             ON options_analysis_history(user_id, created_at DESC)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ============================================================================
    // Task table
    // ============================================================================

    pub async fn insert_task(&self, record: &TaskRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO analysis_tasks
                (id, user_id, task_type, status, priority, input_params,
                 progress_percent, current_step, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.user_id,
                record.task_type.as_str(),
                record.status.as_str(),
                record.priority,
                serde_json::to_string(&record.input_params)?,
                record.progress_percent,
                record.current_step,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Update a task's status, progress and step message.
    ///
    /// The current-step message is capped at 1000 characters and the error
    /// message at 5000. Sets `started_at` on the first PROCESSING
    /// transition and `completed_at` on terminal transitions. Rows already
    /// in a terminal state are never touched.
    pub async fn update_task_progress(
        &self,
        task_id: &str,
        status: TaskStatus,
        progress: i64,
        step: &str,
        error_message: Option<&str>,
    ) -> Result<()> {
        let step = truncate_message(step, MAX_STEP_LEN);

        let error = match error_message {
            Some(e) => Some(truncate_message(e, MAX_ERROR_LEN)),
            // A FAILED transition without an explicit error keeps the step
            // text as the stored error.
            None if status == TaskStatus::Failed => Some(truncate_message(&step, MAX_ERROR_LEN)),
            None => None,
        };

        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;

        let updated = conn.execute(
            "UPDATE analysis_tasks SET
                status = ?2,
                progress_percent = ?3,
                current_step = ?4,
                error_message = COALESCE(?5, error_message),
                started_at = CASE
                    WHEN ?2 = 'processing' AND started_at IS NULL THEN ?6
                    ELSE started_at
                END,
                completed_at = CASE
                    WHEN ?2 IN ('completed', 'failed') THEN ?6
                    ELSE completed_at
                END
             WHERE id = ?1 AND status NOT IN ('completed', 'failed')",
            params![task_id, status.as_str(), progress, step, error, now],
        )?;

        if updated == 0 {
            warn!(task_id, "progress update skipped (unknown or terminal task)");
        }
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, task_type, status, priority, input_params,
                    progress_percent, current_step, result_data, error_message,
                    created_at, started_at, completed_at,
                    related_history_id, related_history_type
             FROM analysis_tasks WHERE id = ?1",
        )?;
        let record = stmt
            .query_row(params![task_id], task_from_row)
            .optional()?;
        Ok(record)
    }

    /// Most recent tasks for a user, optionally filtered by status.
    /// The limit is capped at 50.
    pub async fn get_user_tasks(
        &self,
        user_id: &str,
        limit: usize,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRecord>> {
        let limit = limit.min(50) as i64;
        let conn = self.conn.lock().await;

        let mut out = Vec::new();
        match status {
            Some(s) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, user_id, task_type, status, priority, input_params,
                            progress_percent, current_step, result_data, error_message,
                            created_at, started_at, completed_at,
                            related_history_id, related_history_type
                     FROM analysis_tasks
                     WHERE user_id = ?1 AND status = ?2
                     ORDER BY created_at DESC LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![user_id, s.as_str(), limit], task_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, user_id, task_type, status, priority, input_params,
                            progress_percent, current_step, result_data, error_message,
                            created_at, started_at, completed_at,
                            related_history_id, related_history_type
                     FROM analysis_tasks
                     WHERE user_id = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![user_id, limit], task_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    // ============================================================================
    // Daily analysis cache
    // ============================================================================

    pub async fn get_daily_cache(
        &self,
        ticker: &str,
        style: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyCacheRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, ticker, style, analysis_date, full_analysis_data,
                    source_task_id, created_at
             FROM daily_analysis_cache
             WHERE ticker = ?1 AND style = ?2 AND analysis_date = ?3",
        )?;
        let row = stmt
            .query_row(params![ticker, style, date.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .optional()?;

        match row {
            Some((id, ticker, style, date, payload, source_task_id, created_at)) => {
                Ok(Some(DailyCacheRow {
                    id,
                    ticker,
                    style,
                    analysis_date: date.parse().context("parse analysis_date")?,
                    full_analysis_data: serde_json::from_str(&payload)?,
                    source_task_id,
                    created_at: parse_ts(&created_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn count_daily_cache_rows(
        &self,
        ticker: &str,
        style: &str,
        date: NaiveDate,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM daily_analysis_cache
             WHERE ticker = ?1 AND style = ?2 AND analysis_date = ?3",
            params![ticker, style, date.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ============================================================================
    // Result persistence (single-transaction)
    // ============================================================================

    /// Persist a completed stock analysis: insert the user's history row,
    /// optionally write the daily cache entry, and attach the result to
    /// the task, all in one transaction.
    ///
    /// A daily-cache unique-constraint conflict means another task already
    /// cached this (ticker, style, date); the existing row stays
    /// authoritative and only the history insert proceeds.
    ///
    /// Returns (history_id, cache_written).
    pub async fn save_stock_result(
        &self,
        task_id: &str,
        history: &StockHistoryInsert,
        daily_cache: Option<(&str, &str, NaiveDate)>,
        payload: &Value,
    ) -> Result<(i64, bool)> {
        let now = Utc::now().to_rfc3339();
        let payload_json = serde_json::to_string(payload)?;

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO stock_analysis_history
                (user_id, ticker, style, current_price, target_price,
                 stop_loss_price, market_sentiment, risk_score, risk_level,
                 position_size, ev_score, ev_weighted_pct,
                 recommendation_action, recommendation_confidence,
                 ai_summary, full_analysis_data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                history.user_id,
                history.ticker,
                history.style,
                history.current_price,
                history.target_price,
                history.stop_loss_price,
                history.market_sentiment,
                history.risk_score,
                history.risk_level,
                history.position_size,
                history.ev_score,
                history.ev_weighted_pct,
                history.recommendation_action,
                history.recommendation_confidence,
                history.ai_summary,
                serde_json::to_string(&history.full_analysis_data)?,
                now,
            ],
        )?;
        let history_id = tx.last_insert_rowid();

        let mut cache_written = false;
        if let Some((ticker, style, date)) = daily_cache {
            let inserted = tx.execute(
                "INSERT INTO daily_analysis_cache
                    (ticker, style, analysis_date, full_analysis_data,
                     source_task_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(ticker, style, analysis_date) DO NOTHING",
                params![ticker, style, date.to_string(), payload_json, task_id, now],
            )?;
            cache_written = inserted > 0;
            if cache_written {
                info!(ticker, style, "saved analysis to daily cache");
            } else {
                info!(ticker, style, "daily cache entry already exists, keeping existing row");
            }
        }

        tx.execute(
            "UPDATE analysis_tasks SET
                result_data = ?2,
                related_history_id = ?3,
                related_history_type = 'stock'
             WHERE id = ?1",
            params![task_id, payload_json, history_id],
        )?;

        tx.commit()?;
        Ok((history_id, cache_written))
    }

    /// Persist a completed options analysis: history row plus result
    /// attachment in one transaction. Options analyses never write the
    /// daily cache.
    pub async fn save_options_result(
        &self,
        task_id: &str,
        history: &OptionsHistoryInsert,
        payload: &Value,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let payload_json = serde_json::to_string(payload)?;

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO options_analysis_history
                (user_id, symbol, analysis_type, option_identifier, expiry_date,
                 strike_price, option_type, option_score, iv_rank,
                 vrp_analysis, risk_analysis, ai_summary,
                 full_analysis_data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                history.user_id,
                history.symbol,
                history.analysis_type,
                history.option_identifier,
                history.expiry_date,
                history.strike_price,
                history.option_type,
                history.option_score,
                history.iv_rank,
                history
                    .vrp_analysis
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                history
                    .risk_analysis
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                history.ai_summary,
                serde_json::to_string(&history.full_analysis_data)?,
                now,
            ],
        )?;
        let history_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE analysis_tasks SET
                result_data = ?2,
                related_history_id = ?3,
                related_history_type = 'options'
             WHERE id = ?1",
            params![task_id, payload_json, history_id],
        )?;

        tx.commit()?;
        Ok(history_id)
    }

    pub async fn count_stock_history_for_user(&self, user_id: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM stock_analysis_history WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub async fn count_options_history_for_user(&self, user_id: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM options_analysis_history WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .context("parse timestamp")?
        .with_timezone(&Utc))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let task_type: String = row.get(2)?;
    let status: String = row.get(3)?;
    let input_params: String = row.get(5)?;
    let result_data: Option<String> = row.get(8)?;
    let created_at: String = row.get(10)?;
    let started_at: Option<String> = row.get(11)?;
    let completed_at: Option<String> = row.get(12)?;

    let parse_dt = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
    };

    Ok(TaskRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        task_type: TaskType::parse(&task_type).unwrap_or(TaskType::StockAnalysis),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
        priority: row.get(4)?,
        input_params: serde_json::from_str(&input_params).unwrap_or(Value::Null),
        progress_percent: row.get(6)?,
        current_step: row.get(7)?,
        result_data: result_data
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok()),
        error_message: row.get(9)?,
        created_at: parse_dt(&created_at)?,
        started_at: started_at.as_deref().map(parse_dt).transpose()?,
        completed_at: completed_at.as_deref().map(parse_dt).transpose()?,
        related_history_id: row.get(13)?,
        related_history_type: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_task(id: &str, user: &str) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            user_id: user.to_string(),
            task_type: TaskType::StockAnalysis,
            status: TaskStatus::Pending,
            priority: 100,
            input_params: json!({"ticker": "AAPL", "style": "quality"}),
            progress_percent: 0,
            current_step: Some("Task created, waiting in queue...".into()),
            result_data: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            related_history_id: None,
            related_history_type: None,
        }
    }

    #[tokio::test]
    async fn task_round_trip() {
        let store = AnalysisStore::open_in_memory().unwrap();
        store.insert_task(&sample_task("t1", "u1")).await.unwrap();

        let loaded = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.input_params["ticker"], "AAPL");
        assert!(loaded.started_at.is_none());
    }

    #[tokio::test]
    async fn progress_update_sets_timestamps_and_truncates() {
        let store = AnalysisStore::open_in_memory().unwrap();
        store.insert_task(&sample_task("t1", "u1")).await.unwrap();

        store
            .update_task_progress("t1", TaskStatus::Processing, 10, "Starting analysis...", None)
            .await
            .unwrap();
        let processing = store.get_task("t1").await.unwrap().unwrap();
        assert!(processing.started_at.is_some());
        assert!(processing.completed_at.is_none());

        let long_error = "e".repeat(9000);
        store
            .update_task_progress("t1", TaskStatus::Failed, 10, "Task failed", Some(&long_error))
            .await
            .unwrap();
        let failed = store.get_task("t1").await.unwrap().unwrap();
        assert!(failed.completed_at.is_some());
        let err = failed.error_message.unwrap();
        assert_eq!(err.chars().count(), MAX_ERROR_LEN);
        assert!(err.ends_with("..."));
    }

    #[tokio::test]
    async fn terminal_tasks_are_immutable() {
        let store = AnalysisStore::open_in_memory().unwrap();
        store.insert_task(&sample_task("t1", "u1")).await.unwrap();
        store
            .update_task_progress("t1", TaskStatus::Completed, 100, "done", None)
            .await
            .unwrap();
        store
            .update_task_progress("t1", TaskStatus::Processing, 50, "rewind attempt", None)
            .await
            .unwrap();

        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress_percent, 100);
    }

    #[tokio::test]
    async fn daily_cache_conflict_keeps_first_row() {
        let store = AnalysisStore::open_in_memory().unwrap();
        store.insert_task(&sample_task("t1", "u1")).await.unwrap();
        store.insert_task(&sample_task("t2", "u2")).await.unwrap();

        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let payload1 = json!({"price": 195.0, "score": 72});
        let payload2 = json!({"price": 196.0, "score": 70});

        let h1 = StockHistoryInsert::from_payload("u1", "AAPL", "quality", &payload1);
        let (_, written1) = store
            .save_stock_result("t1", &h1, Some(("AAPL", "quality", date)), &payload1)
            .await
            .unwrap();
        assert!(written1);

        let h2 = StockHistoryInsert::from_payload("u2", "AAPL", "quality", &payload2);
        let (_, written2) = store
            .save_stock_result("t2", &h2, Some(("AAPL", "quality", date)), &payload2)
            .await
            .unwrap();
        assert!(!written2, "second writer must lose silently");

        assert_eq!(
            store
                .count_daily_cache_rows("AAPL", "quality", date)
                .await
                .unwrap(),
            1
        );
        let cached = store
            .get_daily_cache("AAPL", "quality", date)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.full_analysis_data, payload1);
        assert_eq!(cached.source_task_id.as_deref(), Some("t1"));

        // Both history rows exist regardless of who won the cache insert.
        assert_eq!(store.count_stock_history_for_user("u1").await.unwrap(), 1);
        assert_eq!(store.count_stock_history_for_user("u2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn user_task_listing_caps_at_50() {
        let store = AnalysisStore::open_in_memory().unwrap();
        for i in 0..60 {
            store
                .insert_task(&sample_task(&format!("t{i}"), "u1"))
                .await
                .unwrap();
        }
        let tasks = store.get_user_tasks("u1", 500, None).await.unwrap();
        assert_eq!(tasks.len(), 50);
    }
}

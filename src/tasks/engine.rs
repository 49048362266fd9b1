//! Async analysis task engine.
//!
//! A fixed pool of workers drains the in-memory priority queue and
//! drives each task through one of three execution modes: FRESH runs the
//! injected analysis runner, CACHED replays a pre-computed payload
//! behind a realistic progress schedule, and WAITING polls the daily
//! cache until a sibling task publishes its result. Every state change
//! is a single row update; a worker exclusively owns its task row while
//! it is PROCESSING.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::queue::{TaskDescriptor, TaskMode, TaskQueue};
use super::runner::{OptionsAnalysisRunner, QuotaService, RunnerSet, StockAnalysisRunner};
use crate::config::EngineSettings;
use crate::db::AnalysisStore;
use crate::models::{
    OptionsHistoryInsert, StockHistoryInsert, TaskRecord, TaskStatus, TaskType,
};

/// CACHED playback reference schedule: (progress, step, seconds). The
/// per-step delays scale to the configured total duration.
const PLAYBACK_SCHEDULE: [(i64, &str, f64); 5] = [
    (10, "Initializing analysis...", 1.5),
    (30, "Fetching market data...", 2.0),
    (55, "Calculating risk metrics...", 2.0),
    (75, "Running AI analysis...", 2.5),
    (90, "Generating report...", 1.5),
];
const PLAYBACK_REFERENCE_SECONDS: f64 = 9.5;

/// Step messages rotated while a WAITING task polls.
const WAITING_STEPS: [&str; 3] = [
    "Fetching market data...",
    "Calculating risk metrics...",
    "Running AI analysis...",
];

struct EngineInner {
    store: AnalysisStore,
    queue: TaskQueue,
    settings: EngineSettings,
    stock_runner: Arc<dyn StockAnalysisRunner>,
    options_runner: Arc<dyn OptionsAnalysisRunner>,
    quota: Arc<dyn QuotaService>,
    running: AtomicBool,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl TaskEngine {
    pub fn new(store: AnalysisStore, settings: EngineSettings, runners: RunnerSet) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                queue: TaskQueue::new(),
                settings,
                stock_runner: runners.stock,
                options_runner: runners.options,
                quota: runners.quota,
                running: AtomicBool::new(false),
                workers: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start the worker pool. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let count = self.inner.settings.max_workers.max(1);
        info!(workers = count, "starting task engine");

        let mut workers = self.inner.workers.lock();
        for worker_id in 0..count {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(worker_loop(inner, worker_id + 1)));
        }
    }

    /// Stop accepting tasks and let workers drain. Each worker exits
    /// within one queue-poll timeout of finishing its current task.
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("task engine shutting down");
        let handles: Vec<JoinHandle<()>> = self.inner.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("task engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Create a new analysis task and enqueue it. Returns the task id.
    pub async fn create_task(
        &self,
        user_id: &str,
        task_type: TaskType,
        input_params: Value,
        priority: i64,
        mode: TaskMode,
    ) -> Result<String> {
        if !self.is_running() {
            bail!("task engine is not running");
        }
        validate_params(task_type, &input_params, &mode)?;

        self.inner
            .quota
            .check_and_deduct(user_id, task_type)
            .await
            .context("quota check failed")?;

        let task_id = Uuid::new_v4().to_string();
        let record = TaskRecord {
            id: task_id.clone(),
            user_id: user_id.to_string(),
            task_type,
            status: TaskStatus::Pending,
            priority,
            input_params: input_params.clone(),
            progress_percent: 0,
            current_step: Some("Task created, waiting in queue...".to_string()),
            result_data: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            related_history_id: None,
            related_history_type: None,
        };
        self.inner.store.insert_task(&record).await?;

        self.inner.queue.push(TaskDescriptor {
            task_id: task_id.clone(),
            user_id: user_id.to_string(),
            task_type,
            input_params,
            priority,
            mode: mode.clone(),
        });

        let mode_tag = match &mode {
            TaskMode::Fresh => "fresh",
            TaskMode::CachedReplay { .. } => "cached",
            TaskMode::WaitingOn { .. } => "waiting",
        };
        info!(
            task_id,
            user_id,
            task_type = task_type.as_str(),
            mode = mode_tag,
            "task created"
        );
        Ok(task_id)
    }

    /// Current status payload for one task, None when unknown.
    pub async fn get_task_status(&self, task_id: &str) -> Result<Option<Value>> {
        Ok(self
            .inner
            .store
            .get_task(task_id)
            .await?
            .map(|t| t.to_json()))
    }

    /// Most recent tasks for a user (capped at 50).
    pub async fn get_user_tasks(
        &self,
        user_id: &str,
        limit: usize,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Value>> {
        Ok(self
            .inner
            .store
            .get_user_tasks(user_id, limit, status)
            .await?
            .into_iter()
            .map(|t| t.to_json())
            .collect())
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }
}

fn validate_params(task_type: TaskType, params: &Value, mode: &TaskMode) -> Result<()> {
    let require = |key: &str| -> Result<()> {
        match params.get(key).and_then(|v| v.as_str()) {
            Some(s) if !s.trim().is_empty() => Ok(()),
            _ => bail!("missing required parameter: {key}"),
        }
    };

    match task_type {
        TaskType::StockAnalysis => require("ticker")?,
        TaskType::OptionAnalysis => {
            require("symbol")?;
            require("expiry_date")?;
        }
        TaskType::EnhancedOptionAnalysis => {
            require("symbol")?;
            require("option_identifier")?;
        }
    }

    // Replay/waiting modes only exist for stock analyses
    if !matches!(mode, TaskMode::Fresh) && task_type != TaskType::StockAnalysis {
        bail!("cached and waiting modes only apply to stock analysis");
    }
    Ok(())
}

async fn worker_loop(inner: Arc<EngineInner>, worker_id: usize) {
    info!(worker_id, "worker started");
    let poll_timeout = inner.settings.queue_poll_timeout();

    while inner.running.load(Ordering::SeqCst) {
        let descriptor = match inner.queue.pop(poll_timeout).await {
            Some(d) => d,
            None => continue,
        };
        let task_id = descriptor.task_id.clone();
        info!(worker_id, task_id, "processing task");

        if let Err(e) = inner
            .store
            .update_task_progress(&task_id, TaskStatus::Processing, 0, "Starting analysis...", None)
            .await
        {
            error!(worker_id, task_id, error = %e, "failed to mark task processing");
            continue;
        }

        let outcome = match &descriptor.mode {
            TaskMode::CachedReplay { payload } => {
                process_cached(&inner, &descriptor, payload.clone()).await
            }
            TaskMode::WaitingOn { source_task_id } => {
                process_waiting(&inner, &descriptor, source_task_id).await
            }
            TaskMode::Fresh => match descriptor.task_type {
                TaskType::StockAnalysis => process_stock(&inner, &descriptor).await,
                TaskType::OptionAnalysis | TaskType::EnhancedOptionAnalysis => {
                    process_options(&inner, &descriptor).await
                }
            },
        };

        match outcome {
            Ok(()) => info!(worker_id, task_id, "task completed"),
            Err(e) => {
                error!(worker_id, task_id, error = %e, "task failed");
                let message = format!("{e:#}");
                if let Err(update_err) = inner
                    .store
                    .update_task_progress(
                        &task_id,
                        TaskStatus::Failed,
                        0,
                        &format!("Task failed: {message}"),
                        Some(&message),
                    )
                    .await
                {
                    error!(worker_id, task_id, error = %update_err, "failed to mark task failed");
                }
            }
        }
    }

    info!(worker_id, "worker stopped");
}

async fn set_progress(
    inner: &EngineInner,
    task_id: &str,
    progress: i64,
    step: &str,
) -> Result<()> {
    inner
        .store
        .update_task_progress(task_id, TaskStatus::Processing, progress, step, None)
        .await
}

fn ticker_from_params(params: &Value) -> String {
    params
        .get("ticker")
        .or_else(|| params.get("symbol"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn style_from_params(params: &Value) -> String {
    params
        .get("style")
        .and_then(|v| v.as_str())
        .unwrap_or("quality")
        .to_string()
}

/// CACHED replay: simulate the normal progress schedule, then deliver
/// the pre-computed payload. The caller experience matches a fresh run.
async fn process_cached(
    inner: &EngineInner,
    descriptor: &TaskDescriptor,
    payload: Value,
) -> Result<()> {
    let task_id = &descriptor.task_id;
    let ticker = ticker_from_params(&descriptor.input_params);
    let style = style_from_params(&descriptor.input_params);
    info!(task_id, ticker, "replaying cached analysis");

    let scale = inner.settings.cached_playback_seconds / PLAYBACK_REFERENCE_SECONDS;
    for (progress, step, delay) in PLAYBACK_SCHEDULE {
        set_progress(inner, task_id, progress, step).await?;
        tokio::time::sleep(Duration::from_secs_f64(delay * scale.max(0.0))).await;
    }

    set_progress(inner, task_id, 95, "Saving analysis results...").await?;

    let history = StockHistoryInsert::from_payload(&descriptor.user_id, &ticker, &style, &payload);
    inner
        .store
        .save_stock_result(task_id, &history, None, &payload)
        .await
        .context("failed to save cached task result")?;

    inner
        .store
        .update_task_progress(
            task_id,
            TaskStatus::Completed,
            100,
            "Analysis completed successfully",
            None,
        )
        .await?;
    Ok(())
}

/// WAITING: poll the daily cache until the source task publishes its
/// result, then reuse it under this user's own task and history row.
async fn process_waiting(
    inner: &EngineInner,
    descriptor: &TaskDescriptor,
    source_task_id: &str,
) -> Result<()> {
    let task_id = &descriptor.task_id;
    let ticker = ticker_from_params(&descriptor.input_params);
    let style = style_from_params(&descriptor.input_params);
    info!(task_id, source_task_id, ticker, "waiting on sibling task");

    set_progress(inner, task_id, 10, "Initializing analysis...").await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    set_progress(inner, task_id, 20, "Fetching market data...").await?;

    let max_wait = inner.settings.waiting_max_wait_seconds;
    let poll_interval = inner.settings.waiting_poll_interval_seconds.max(1);
    let mut waited: u64 = 0;
    let mut payload: Option<Value> = None;

    while waited < max_wait {
        let today = Utc::now().date_naive();
        if let Some(row) = inner.store.get_daily_cache(&ticker, &style, today).await? {
            info!(task_id, ticker, style, "found daily cache entry");
            payload = Some(row.full_analysis_data);
            break;
        }

        if let Some(source) = inner.store.get_task(source_task_id).await? {
            if source.status == TaskStatus::Failed {
                bail!(
                    "source task {source_task_id} failed: {}",
                    source.error_message.unwrap_or_default()
                );
            }
        }

        // Smooth simulated progress while polling
        let progress = (20 + (waited as f64 / max_wait as f64 * 50.0) as i64).min(70);
        let step = WAITING_STEPS[((waited / 20) as usize).min(WAITING_STEPS.len() - 1)];
        set_progress(inner, task_id, progress, step).await?;

        tokio::time::sleep(Duration::from_secs(poll_interval)).await;
        waited += poll_interval;
    }

    let payload = payload
        .ok_or_else(|| anyhow!("timed out waiting for source task {source_task_id} to complete"))?;

    set_progress(inner, task_id, 80, "Generating report...").await?;
    tokio::time::sleep(Duration::from_secs_f64(1.5)).await;
    set_progress(inner, task_id, 95, "Saving analysis results...").await?;

    let history = StockHistoryInsert::from_payload(&descriptor.user_id, &ticker, &style, &payload);
    inner
        .store
        .save_stock_result(task_id, &history, None, &payload)
        .await
        .context("failed to save waiting task result")?;

    inner
        .store
        .update_task_progress(
            task_id,
            TaskStatus::Completed,
            100,
            "Analysis completed successfully",
            None,
        )
        .await?;
    Ok(())
}

/// FRESH stock analysis: run the injected runner and persist history,
/// daily cache and task result.
async fn process_stock(inner: &EngineInner, descriptor: &TaskDescriptor) -> Result<()> {
    let task_id = &descriptor.task_id;
    let ticker = ticker_from_params(&descriptor.input_params);
    let style = style_from_params(&descriptor.input_params);
    info!(task_id, ticker, style, "running stock analysis");

    set_progress(
        inner,
        task_id,
        10,
        &format!("Initializing analysis for {ticker}..."),
    )
    .await?;
    set_progress(inner, task_id, 30, "Fetching market data...").await?;
    set_progress(inner, task_id, 60, "Running AI analysis...").await?;

    // Runner errors propagate unwrapped so the task's error_message is
    // the runner's own message.
    let payload = inner.stock_runner.run(&ticker, &style).await?;
    if let Some(err) = payload.get("error").and_then(|v| v.as_str()) {
        bail!("stock analysis failed: {err}");
    }

    set_progress(inner, task_id, 90, "Saving analysis results...").await?;

    let today = Utc::now().date_naive();
    let history = StockHistoryInsert::from_payload(&descriptor.user_id, &ticker, &style, &payload);
    let (history_id, cache_written) = inner
        .store
        .save_stock_result(task_id, &history, Some((&ticker, &style, today)), &payload)
        .await
        .context("failed to save stock analysis result")?;

    if !cache_written {
        warn!(task_id, ticker, style, "daily cache insert lost the race, kept existing entry");
    }

    inner
        .store
        .update_task_progress(
            task_id,
            TaskStatus::Completed,
            100,
            "Analysis completed successfully",
            None,
        )
        .await?;
    info!(task_id, ticker, history_id, "stock analysis completed");
    Ok(())
}

/// FRESH options analysis: basic chain mode needs an expiry date,
/// enhanced mode a contract identifier. No daily cache is written.
async fn process_options(inner: &EngineInner, descriptor: &TaskDescriptor) -> Result<()> {
    let task_id = &descriptor.task_id;
    let params = &descriptor.input_params;
    let symbol = params
        .get("symbol")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    info!(task_id, symbol, task_type = descriptor.task_type.as_str(), "running options analysis");

    set_progress(
        inner,
        task_id,
        10,
        &format!("Initializing options analysis for {symbol}..."),
    )
    .await?;
    set_progress(inner, task_id, 40, "Fetching options chain data...").await?;
    set_progress(inner, task_id, 70, "Analyzing options strategies...").await?;

    let payload = match descriptor.task_type {
        TaskType::EnhancedOptionAnalysis => {
            let identifier = params
                .get("option_identifier")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("missing required parameter: option_identifier"))?;
            inner.options_runner.run_enhanced(&symbol, identifier).await?
        }
        _ => {
            let expiry = params
                .get("expiry_date")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("missing required parameter: expiry_date"))?;
            inner.options_runner.run_chain(&symbol, expiry).await?
        }
    };
    if let Some(err) = payload.get("error").and_then(|v| v.as_str()) {
        bail!("options analysis failed: {err}");
    }

    set_progress(inner, task_id, 90, "Saving analysis results...").await?;

    let history = OptionsHistoryInsert::from_payload(
        &descriptor.user_id,
        &symbol,
        descriptor.task_type,
        params,
        &payload,
    );
    let history_id = inner
        .store
        .save_options_result(task_id, &history, &payload)
        .await
        .context("failed to save options analysis result")?;

    inner
        .store
        .update_task_progress(
            task_id,
            TaskStatus::Completed,
            100,
            "Options analysis completed successfully",
            None,
        )
        .await?;
    info!(task_id, symbol, history_id, "options analysis completed");
    Ok(())
}

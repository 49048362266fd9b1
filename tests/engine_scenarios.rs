//! End-to-end task engine scenarios.
//!
//! Runs the engine against an in-memory store with scripted runners.
//! Timing-sensitive scenarios use paused tokio time, so the wall-clock
//! assertions are against virtual time.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use marketmind_backend::config::EngineSettings;
use marketmind_backend::db::AnalysisStore;
use marketmind_backend::models::{TaskStatus, TaskType};
use marketmind_backend::tasks::runner::{
    NoopQuota, OptionsAnalysisRunner, QuotaService, RunnerSet, StockAnalysisRunner,
};
use marketmind_backend::tasks::{TaskEngine, TaskMode};

/// Stock runner driven by a closure, with an optional artificial delay.
struct ScriptedStockRunner {
    delay: Duration,
    calls: AtomicUsize,
    produce: Box<dyn Fn(&str, &str) -> Result<Value> + Send + Sync>,
}

impl ScriptedStockRunner {
    fn ok(delay: Duration, payload: Value) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
            produce: Box::new(move |_, _| Ok(payload.clone())),
        })
    }

    fn failing(message: &'static str) -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            produce: Box::new(move |_, _| Err(anyhow!(message))),
        })
    }
}

#[async_trait]
impl StockAnalysisRunner for ScriptedStockRunner {
    async fn run(&self, ticker: &str, style: &str) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.produce)(ticker, style)
    }
}

struct ScriptedOptionsRunner {
    payload: Value,
}

#[async_trait]
impl OptionsAnalysisRunner for ScriptedOptionsRunner {
    async fn run_chain(&self, _symbol: &str, _expiry_date: &str) -> Result<Value> {
        Ok(self.payload.clone())
    }
    async fn run_enhanced(&self, _symbol: &str, _option_identifier: &str) -> Result<Value> {
        Ok(self.payload.clone())
    }
}

fn engine_with(
    store: AnalysisStore,
    stock: Arc<dyn StockAnalysisRunner>,
    workers: usize,
) -> TaskEngine {
    let settings = EngineSettings {
        max_workers: workers,
        ..Default::default()
    };
    let runners = RunnerSet {
        stock,
        options: Arc::new(ScriptedOptionsRunner {
            payload: json!({"option_score": 75.0}),
        }),
        quota: Arc::new(NoopQuota),
    };
    let engine = TaskEngine::new(store, settings, runners);
    engine.start();
    engine
}

/// Poll until the task reaches a terminal state.
async fn wait_terminal(engine: &TaskEngine, task_id: &str) -> Value {
    for _ in 0..100_000 {
        if let Some(status) = engine.get_task_status(task_id).await.unwrap() {
            let state = status["status"].as_str().unwrap_or_default().to_string();
            if state == "completed" || state == "failed" {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("task {task_id} never reached a terminal state");
}

#[tokio::test(start_paused = true)]
async fn cached_happy_path_replays_payload() {
    let store = AnalysisStore::open_in_memory().unwrap();
    let engine = engine_with(
        store.clone(),
        ScriptedStockRunner::ok(Duration::ZERO, json!({})),
        1,
    );

    let payload = json!({"price": 195.0, "score": 72});
    let started = tokio::time::Instant::now();
    let task_id = engine
        .create_task(
            "u1",
            TaskType::StockAnalysis,
            json!({"ticker": "AAPL", "style": "quality"}),
            100,
            TaskMode::CachedReplay {
                payload: payload.clone(),
            },
        )
        .await
        .unwrap();

    let status = wait_terminal(&engine, &task_id).await;
    let elapsed = started.elapsed().as_secs_f64();

    assert_eq!(status["status"], "completed");
    assert_eq!(status["progress_percent"], 100);
    assert_eq!(status["result_data"], payload);
    assert_eq!(status["related_history_type"], "stock");
    assert!(
        (9.0..=13.0).contains(&elapsed),
        "playback took {elapsed}s, expected ~10s"
    );

    assert_eq!(store.count_stock_history_for_user("u1").await.unwrap(), 1);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn n_identical_cached_tasks_make_n_history_rows() {
    let store = AnalysisStore::open_in_memory().unwrap();
    let engine = engine_with(
        store.clone(),
        ScriptedStockRunner::ok(Duration::ZERO, json!({})),
        3,
    );

    let payload = json!({"price": 10.0});
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            engine
                .create_task(
                    "u1",
                    TaskType::StockAnalysis,
                    json!({"ticker": "AAPL", "style": "quality"}),
                    100,
                    TaskMode::CachedReplay {
                        payload: payload.clone(),
                    },
                )
                .await
                .unwrap(),
        );
    }

    for id in &ids {
        let status = wait_terminal(&engine, id).await;
        assert_eq!(status["status"], "completed");
        assert_eq!(status["result_data"], payload);
    }
    assert_eq!(store.count_stock_history_for_user("u1").await.unwrap(), 3);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn waiting_task_inherits_fresh_result() {
    let store = AnalysisStore::open_in_memory().unwrap();
    let payload = json!({
        "data": {"price": 250.0},
        "risk": {"score": 40.0},
        "report": "growth setup"
    });
    let runner = ScriptedStockRunner::ok(Duration::from_secs(8), payload.clone());
    let engine = engine_with(store.clone(), runner.clone(), 2);

    let t1 = engine
        .create_task(
            "u1",
            TaskType::StockAnalysis,
            json!({"ticker": "TSLA", "style": "growth"}),
            100,
            TaskMode::Fresh,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;

    let t2 = engine
        .create_task(
            "u2",
            TaskType::StockAnalysis,
            json!({"ticker": "TSLA", "style": "growth"}),
            100,
            TaskMode::WaitingOn {
                source_task_id: t1.clone(),
            },
        )
        .await
        .unwrap();

    let s1 = wait_terminal(&engine, &t1).await;
    let s2 = wait_terminal(&engine, &t2).await;

    assert_eq!(s1["status"], "completed");
    assert_eq!(s2["status"], "completed");
    assert_eq!(s1["result_data"], s2["result_data"]);
    assert_eq!(runner.calls.load(Ordering::SeqCst), 1, "only T1 runs the analysis");

    // One history row per user, exactly one daily cache row
    assert_eq!(store.count_stock_history_for_user("u1").await.unwrap(), 1);
    assert_eq!(store.count_stock_history_for_user("u2").await.unwrap(), 1);
    let today = Utc::now().date_naive();
    assert_eq!(
        store
            .count_daily_cache_rows("TSLA", "growth", today)
            .await
            .unwrap(),
        1
    );
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn waiting_task_fails_when_source_fails() {
    let store = AnalysisStore::open_in_memory().unwrap();
    let engine = engine_with(store.clone(), ScriptedStockRunner::failing("insufficient data"), 2);

    let t1 = engine
        .create_task(
            "u1",
            TaskType::StockAnalysis,
            json!({"ticker": "XYZ", "style": "value"}),
            100,
            TaskMode::Fresh,
        )
        .await
        .unwrap();
    let t2 = engine
        .create_task(
            "u2",
            TaskType::StockAnalysis,
            json!({"ticker": "XYZ", "style": "value"}),
            100,
            TaskMode::WaitingOn {
                source_task_id: t1.clone(),
            },
        )
        .await
        .unwrap();

    let s2 = wait_terminal(&engine, &t2).await;
    assert_eq!(s2["status"], "failed");
    let message = s2["error_message"].as_str().unwrap();
    assert!(message.contains(&t1), "error names the source task: {message}");
    assert!(message.contains("insufficient data"));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_fresh_task_leaves_no_rows() {
    let store = AnalysisStore::open_in_memory().unwrap();
    let engine = engine_with(store.clone(), ScriptedStockRunner::failing("insufficient data"), 1);

    let task_id = engine
        .create_task(
            "u1",
            TaskType::StockAnalysis,
            json!({"ticker": "XYZ", "style": "value"}),
            100,
            TaskMode::Fresh,
        )
        .await
        .unwrap();

    let status = wait_terminal(&engine, &task_id).await;
    assert_eq!(status["status"], "failed");
    assert!(status["error_message"]
        .as_str()
        .unwrap()
        .starts_with("insufficient data"));
    assert!(status["completed_at"].is_string());
    assert!(status["progress_percent"].as_i64().unwrap() < 100);

    let today = Utc::now().date_naive();
    assert_eq!(
        store.count_daily_cache_rows("XYZ", "value", today).await.unwrap(),
        0
    );
    assert_eq!(store.count_stock_history_for_user("u1").await.unwrap(), 0);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn fresh_stock_task_writes_cache_and_history() {
    let store = AnalysisStore::open_in_memory().unwrap();
    let payload = json!({"data": {"price": 100.0}, "risk": {}, "report": "ok"});
    let engine = engine_with(
        store.clone(),
        ScriptedStockRunner::ok(Duration::ZERO, payload.clone()),
        1,
    );

    let task_id = engine
        .create_task(
            "u1",
            TaskType::StockAnalysis,
            json!({"ticker": "MSFT", "style": "quality"}),
            100,
            TaskMode::Fresh,
        )
        .await
        .unwrap();

    let status = wait_terminal(&engine, &task_id).await;
    assert_eq!(status["status"], "completed");
    assert_eq!(status["result_data"], payload);

    let today = Utc::now().date_naive();
    let cached = store
        .get_daily_cache("MSFT", "quality", today)
        .await
        .unwrap()
        .expect("daily cache row written");
    assert_eq!(cached.full_analysis_data, payload);
    assert_eq!(cached.source_task_id.as_deref(), Some(task_id.as_str()));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn options_task_writes_options_history_only() {
    let store = AnalysisStore::open_in_memory().unwrap();
    let engine = engine_with(
        store.clone(),
        ScriptedStockRunner::ok(Duration::ZERO, json!({})),
        1,
    );

    let task_id = engine
        .create_task(
            "u1",
            TaskType::OptionAnalysis,
            json!({"symbol": "NVDA", "expiry_date": "2026-09-18"}),
            100,
            TaskMode::Fresh,
        )
        .await
        .unwrap();

    let status = wait_terminal(&engine, &task_id).await;
    assert_eq!(status["status"], "completed");
    assert_eq!(status["related_history_type"], "options");
    assert_eq!(store.count_options_history_for_user("u1").await.unwrap(), 1);
    assert_eq!(store.count_stock_history_for_user("u1").await.unwrap(), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn option_params_are_validated_up_front() {
    let store = AnalysisStore::open_in_memory().unwrap();
    let engine = engine_with(
        store,
        ScriptedStockRunner::ok(Duration::ZERO, json!({})),
        1,
    );

    let missing_expiry = engine
        .create_task(
            "u1",
            TaskType::OptionAnalysis,
            json!({"symbol": "NVDA"}),
            100,
            TaskMode::Fresh,
        )
        .await;
    assert!(missing_expiry.is_err());

    let missing_identifier = engine
        .create_task(
            "u1",
            TaskType::EnhancedOptionAnalysis,
            json!({"symbol": "NVDA"}),
            100,
            TaskMode::Fresh,
        )
        .await;
    assert!(missing_identifier.is_err());

    let waiting_options = engine
        .create_task(
            "u1",
            TaskType::OptionAnalysis,
            json!({"symbol": "NVDA", "expiry_date": "2026-09-18"}),
            100,
            TaskMode::WaitingOn {
                source_task_id: "other".into(),
            },
        )
        .await;
    assert!(waiting_options.is_err(), "waiting mode is stock-only");
    engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_rejects_new_tasks() {
    let store = AnalysisStore::open_in_memory().unwrap();
    let engine = engine_with(
        store,
        ScriptedStockRunner::ok(Duration::ZERO, json!({})),
        1,
    );
    engine.shutdown().await;

    let result = engine
        .create_task(
            "u1",
            TaskType::StockAnalysis,
            json!({"ticker": "AAPL"}),
            100,
            TaskMode::Fresh,
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn quota_denial_blocks_creation() {
    struct DenyQuota;
    #[async_trait]
    impl QuotaService for DenyQuota {
        async fn check_and_deduct(&self, _user_id: &str, _task_type: TaskType) -> Result<()> {
            Err(anyhow!("daily quota exhausted"))
        }
    }

    let store = AnalysisStore::open_in_memory().unwrap();
    let runners = RunnerSet {
        stock: ScriptedStockRunner::ok(Duration::ZERO, json!({})),
        options: Arc::new(ScriptedOptionsRunner {
            payload: json!({}),
        }),
        quota: Arc::new(DenyQuota),
    };
    let engine = TaskEngine::new(store, EngineSettings::default(), runners);
    engine.start();

    let result = engine
        .create_task(
            "u1",
            TaskType::StockAnalysis,
            json!({"ticker": "AAPL"}),
            100,
            TaskMode::Fresh,
        )
        .await;
    assert!(result.unwrap_err().to_string().contains("quota"));
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn user_task_listing_is_most_recent_first() {
    let store = AnalysisStore::open_in_memory().unwrap();
    let engine = engine_with(
        store,
        ScriptedStockRunner::ok(Duration::ZERO, json!({"data": {"price": 1.0}})),
        1,
    );

    let mut ids = Vec::new();
    for ticker in ["AAPL", "MSFT"] {
        // Space creations apart so created_at ordering is deterministic
        tokio::time::sleep(Duration::from_millis(5)).await;
        ids.push(
            engine
                .create_task(
                    "u1",
                    TaskType::StockAnalysis,
                    json!({"ticker": ticker}),
                    100,
                    TaskMode::Fresh,
                )
                .await
                .unwrap(),
        );
    }
    for id in &ids {
        wait_terminal(&engine, id).await;
    }

    let tasks = engine.get_user_tasks("u1", 10, None).await.unwrap();
    assert_eq!(tasks.len(), 2);

    let completed = engine
        .get_user_tasks("u1", 10, Some(TaskStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 2);
    let pending = engine
        .get_user_tasks("u1", 10, Some(TaskStatus::Pending))
        .await
        .unwrap();
    assert!(pending.is_empty());
    engine.shutdown().await;
}

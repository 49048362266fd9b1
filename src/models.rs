//! Persistent entity types for the analysis core.
//!
//! These mirror the relational schema managed by [`crate::db::AnalysisStore`]:
//! the task table, the daily analysis cache, and the per-user history tables.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Kind of analysis a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    StockAnalysis,
    OptionAnalysis,
    EnhancedOptionAnalysis,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::StockAnalysis => "stock_analysis",
            TaskType::OptionAnalysis => "option_analysis",
            TaskType::EnhancedOptionAnalysis => "enhanced_option_analysis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stock_analysis" => Some(TaskType::StockAnalysis),
            "option_analysis" => Some(TaskType::OptionAnalysis),
            "enhanced_option_analysis" => Some(TaskType::EnhancedOptionAnalysis),
            _ => None,
        }
    }
}

/// Task lifecycle state. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Display cap for the current-step message.
pub const MAX_STEP_LEN: usize = 1000;
/// Storage cap for error messages.
pub const MAX_ERROR_LEN: usize = 5000;

/// Truncate a message to `max` characters, marking the cut with `...`.
pub fn truncate_message(msg: &str, max: usize) -> String {
    if msg.chars().count() <= max {
        return msg.to_string();
    }
    let head: String = msg.chars().take(max.saturating_sub(3)).collect();
    format!("{head}...")
}

/// A row of the analysis task table.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub user_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: i64,
    pub input_params: Value,
    pub progress_percent: i64,
    pub current_step: Option<String>,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub related_history_id: Option<i64>,
    pub related_history_type: Option<String>,
}

impl TaskRecord {
    /// Shape returned by the task status API.
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "user_id": self.user_id,
            "task_type": self.task_type.as_str(),
            "status": self.status.as_str(),
            "progress_percent": self.progress_percent,
            "current_step": self.current_step,
            "input_params": self.input_params,
            "result_data": self.result_data,
            "error_message": self.error_message,
            "created_at": self.created_at.to_rfc3339(),
            "started_at": self.started_at.map(|t| t.to_rfc3339()),
            "completed_at": self.completed_at.map(|t| t.to_rfc3339()),
            "related_history_id": self.related_history_id,
            "related_history_type": self.related_history_type,
        })
    }
}

/// A row of the daily analysis cache: the canonical result for one
/// (ticker, style, date) triple.
#[derive(Debug, Clone)]
pub struct DailyCacheRow {
    pub id: i64,
    pub ticker: String,
    pub style: String,
    pub analysis_date: NaiveDate,
    pub full_analysis_data: Value,
    pub source_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insertable stock analysis history row with list-rendering summary
/// fields extracted from the full payload.
#[derive(Debug, Clone)]
pub struct StockHistoryInsert {
    pub user_id: String,
    pub ticker: String,
    pub style: String,
    pub current_price: Option<f64>,
    pub target_price: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub market_sentiment: Option<f64>,
    pub risk_score: Option<f64>,
    pub risk_level: Option<String>,
    pub position_size: Option<f64>,
    pub ev_score: Option<f64>,
    pub ev_weighted_pct: Option<f64>,
    pub recommendation_action: Option<String>,
    pub recommendation_confidence: Option<String>,
    pub ai_summary: Option<String>,
    pub full_analysis_data: Value,
}

fn value_f64(v: &Value) -> Option<f64> {
    v.as_f64()
}

fn value_string(v: &Value) -> Option<String> {
    v.as_str().map(|s| s.to_string())
}

impl StockHistoryInsert {
    /// Build a history row from a full analysis payload. The summary
    /// fields live at well-known paths inside the payload; anything
    /// missing becomes NULL.
    pub fn from_payload(user_id: &str, ticker: &str, style: &str, payload: &Value) -> Self {
        let data = payload.get("data").cloned().unwrap_or(Value::Null);
        let risk = payload.get("risk").cloned().unwrap_or(Value::Null);
        let ev = data.get("ev_model").cloned().unwrap_or(Value::Null);
        let recommendation = ev.get("recommendation").cloned().unwrap_or(Value::Null);

        let ai_summary = match payload.get("report") {
            Some(Value::String(s)) if !s.is_empty() => Some(truncate_message(s, 1000)),
            Some(Value::Object(m)) => m
                .get("summary")
                .and_then(|s| s.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| truncate_message(s, 1000)),
            _ => None,
        };

        Self {
            user_id: user_id.to_string(),
            ticker: ticker.to_string(),
            style: style.to_string(),
            current_price: data.get("price").and_then(value_f64),
            target_price: data.get("target_price").and_then(value_f64),
            stop_loss_price: data.get("stop_loss_price").and_then(value_f64),
            market_sentiment: data.get("market_sentiment").and_then(value_f64),
            risk_score: risk.get("score").and_then(value_f64),
            risk_level: risk.get("level").and_then(value_string),
            position_size: risk.get("suggested_position").and_then(value_f64),
            ev_score: ev.get("ev_score").and_then(value_f64),
            ev_weighted_pct: ev.get("ev_weighted_pct").and_then(value_f64),
            recommendation_action: recommendation.get("action").and_then(value_string),
            recommendation_confidence: recommendation.get("confidence").and_then(value_string),
            ai_summary,
            full_analysis_data: payload.clone(),
        }
    }
}

/// Insertable options analysis history row.
#[derive(Debug, Clone)]
pub struct OptionsHistoryInsert {
    pub user_id: String,
    pub symbol: String,
    /// "basic_chain" or "enhanced_analysis"
    pub analysis_type: String,
    pub option_identifier: Option<String>,
    pub expiry_date: Option<String>,
    pub strike_price: Option<f64>,
    pub option_type: Option<String>,
    pub option_score: Option<f64>,
    pub iv_rank: Option<f64>,
    pub vrp_analysis: Option<Value>,
    pub risk_analysis: Option<Value>,
    pub ai_summary: Option<String>,
    pub full_analysis_data: Value,
}

impl OptionsHistoryInsert {
    pub fn from_payload(
        user_id: &str,
        symbol: &str,
        task_type: TaskType,
        params: &Value,
        payload: &Value,
    ) -> Self {
        let analysis_type = if task_type == TaskType::EnhancedOptionAnalysis {
            "enhanced_analysis"
        } else {
            "basic_chain"
        };

        Self {
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            analysis_type: analysis_type.to_string(),
            option_identifier: params.get("option_identifier").and_then(value_string),
            expiry_date: params.get("expiry_date").and_then(value_string),
            strike_price: payload.get("strike_price").and_then(value_f64),
            option_type: payload.get("option_type").and_then(value_string),
            option_score: payload.get("option_score").and_then(value_f64),
            iv_rank: payload.get("iv_rank").and_then(value_f64),
            vrp_analysis: payload.get("vrp_analysis").cloned().filter(|v| !v.is_null()),
            risk_analysis: payload.get("risk_analysis").cloned().filter(|v| !v.is_null()),
            ai_summary: payload
                .get("ai_summary")
                .and_then(|s| s.as_str())
                .map(|s| truncate_message(s, 1000)),
            full_analysis_data: payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truncation_marks_the_cut() {
        let long = "x".repeat(1200);
        let out = truncate_message(&long, MAX_STEP_LEN);
        assert_eq!(out.chars().count(), MAX_STEP_LEN);
        assert!(out.ends_with("..."));

        let short = "all good";
        assert_eq!(truncate_message(short, MAX_STEP_LEN), short);
    }

    #[test]
    fn stock_history_extracts_summary_fields() {
        let payload = json!({
            "data": {
                "price": 195.0,
                "target_price": 220.0,
                "stop_loss_price": 180.0,
                "market_sentiment": 0.62,
                "ev_model": {
                    "ev_score": 71.5,
                    "ev_weighted_pct": 0.08,
                    "recommendation": {"action": "buy", "confidence": "high"}
                }
            },
            "risk": {"score": 42.0, "level": "medium", "suggested_position": 0.15},
            "report": {"summary": "Solid setup."}
        });

        let row = StockHistoryInsert::from_payload("u1", "AAPL", "quality", &payload);
        assert_eq!(row.current_price, Some(195.0));
        assert_eq!(row.risk_level.as_deref(), Some("medium"));
        assert_eq!(row.recommendation_action.as_deref(), Some("buy"));
        assert_eq!(row.ai_summary.as_deref(), Some("Solid setup."));
        assert_eq!(row.full_analysis_data, payload);
    }

    #[test]
    fn options_history_maps_task_type_to_analysis_type() {
        let params = json!({"symbol": "NVDA", "expiry_date": "2026-09-18"});
        let payload = json!({"option_score": 80.0});

        let basic = OptionsHistoryInsert::from_payload(
            "u1",
            "NVDA",
            TaskType::OptionAnalysis,
            &params,
            &payload,
        );
        assert_eq!(basic.analysis_type, "basic_chain");
        assert_eq!(basic.expiry_date.as_deref(), Some("2026-09-18"));

        let enhanced = OptionsHistoryInsert::from_payload(
            "u1",
            "NVDA",
            TaskType::EnhancedOptionAnalysis,
            &json!({"option_identifier": "NVDA260918C00500000"}),
            &payload,
        );
        assert_eq!(enhanced.analysis_type, "enhanced_analysis");
    }

    #[test]
    fn status_payload_shape() {
        let record = TaskRecord {
            id: "t1".into(),
            user_id: "u1".into(),
            task_type: TaskType::StockAnalysis,
            status: TaskStatus::Pending,
            priority: 100,
            input_params: json!({"ticker": "AAPL"}),
            progress_percent: 0,
            current_step: Some("Task created, waiting in queue...".into()),
            result_data: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            related_history_id: None,
            related_history_type: None,
        };
        let v = record.to_json();
        assert_eq!(v["status"], "pending");
        assert_eq!(v["task_type"], "stock_analysis");
        assert!(v["started_at"].is_null());
    }
}

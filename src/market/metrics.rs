//! Call metrics for the market-data service.
//!
//! A bounded ring buffer of call records plus per-provider and
//! per-data-type aggregates. Every router call lands here; the JSON
//! shape of `get_stats` is a stable operational contract.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tracing::{debug, info};

use super::types::DataType;

/// Result classification of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResult {
    Success,
    CacheHit,
    Fallback,
    Failure,
    Timeout,
    RateLimited,
}

impl CallResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallResult::Success => "success",
            CallResult::CacheHit => "cache_hit",
            CallResult::Fallback => "fallback",
            CallResult::Failure => "failure",
            CallResult::Timeout => "timeout",
            CallResult::RateLimited => "rate_limited",
        }
    }

    fn is_error(&self) -> bool {
        matches!(self, CallResult::Failure | CallResult::Timeout)
    }
}

/// Record of a single data fetch operation.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub timestamp: DateTime<Utc>,
    pub data_type: DataType,
    pub symbol: String,
    pub providers_tried: Vec<String>,
    pub provider_used: Option<String>,
    pub result: CallResult,
    pub cache_hit: bool,
    pub latency_ms: f64,
    pub fallback_used: bool,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl CallRecord {
    pub fn to_json(&self) -> Value {
        json!({
            "timestamp": self.timestamp.to_rfc3339(),
            "data_type": self.data_type.as_str(),
            "symbol": self.symbol,
            "providers_tried": self.providers_tried,
            "provider_used": self.provider_used,
            "result": self.result.as_str(),
            "cache_hit": self.cache_hit,
            "latency_ms": (self.latency_ms * 100.0).round() / 100.0,
            "fallback_used": self.fallback_used,
            "error_type": self.error_type,
            "error_message": self.error_message,
        })
    }
}

/// Inputs for recording one call.
#[derive(Debug, Clone, Default)]
pub struct CallEvent {
    pub data_type: Option<DataType>,
    pub symbol: String,
    pub providers_tried: Vec<String>,
    pub provider_used: Option<String>,
    pub latency_ms: f64,
    pub cache_hit: bool,
    pub success: bool,
    pub fallback_used: bool,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub timeout: bool,
    pub rate_limited: bool,
}

#[derive(Debug, Default, Clone)]
struct ProviderMetrics {
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    timeout_calls: u64,
    rate_limited_calls: u64,
    total_latency_ms: f64,
    min_latency_ms: Option<f64>,
    max_latency_ms: f64,
    last_error: Option<String>,
    last_error_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
}

impl ProviderMetrics {
    fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.successful_calls as f64 / self.total_calls as f64 * 100.0
    }

    fn avg_latency_ms(&self) -> f64 {
        if self.successful_calls == 0 {
            return 0.0;
        }
        self.total_latency_ms / self.successful_calls as f64
    }

    fn to_json(&self) -> Value {
        json!({
            "total_calls": self.total_calls,
            "successful_calls": self.successful_calls,
            "failed_calls": self.failed_calls,
            "timeout_calls": self.timeout_calls,
            "rate_limited_calls": self.rate_limited_calls,
            "success_rate": round2(self.success_rate()),
            "avg_latency_ms": round2(self.avg_latency_ms()),
            "min_latency_ms": self.min_latency_ms.map(round2),
            "max_latency_ms": round2(self.max_latency_ms),
            "last_error": self.last_error,
            "last_error_time": self.last_error_time.map(|t| t.to_rfc3339()),
            "last_success_time": self.last_success_time.map(|t| t.to_rfc3339()),
        })
    }
}

#[derive(Debug, Default, Clone)]
struct DataTypeMetrics {
    total_calls: u64,
    cache_hits: u64,
    cache_misses: u64,
    fallback_used: u64,
    failures: u64,
}

impl DataTypeMetrics {
    fn to_json(&self) -> Value {
        let hit_rate = if self.total_calls > 0 {
            self.cache_hits as f64 / self.total_calls as f64 * 100.0
        } else {
            0.0
        };
        let fallback_rate = if self.total_calls > 0 {
            self.fallback_used as f64 / self.total_calls as f64 * 100.0
        } else {
            0.0
        };
        json!({
            "total_calls": self.total_calls,
            "cache_hits": self.cache_hits,
            "cache_misses": self.cache_misses,
            "cache_hit_rate": round2(hit_rate),
            "fallback_used": self.fallback_used,
            "fallback_rate": round2(fallback_rate),
            "failures": self.failures,
        })
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

struct CollectorInner {
    records: VecDeque<CallRecord>,
    provider_metrics: HashMap<String, ProviderMetrics>,
    data_type_metrics: HashMap<DataType, DataTypeMetrics>,
    last_summary_log: Instant,
    start_time: DateTime<Utc>,
    start_instant: Instant,
}

/// Collects and aggregates call metrics. Owned by the market-data
/// service as a process-wide handle.
pub struct MetricsCollector {
    max_records: usize,
    log_interval_seconds: u64,
    inner: Mutex<CollectorInner>,
}

pub const DEFAULT_MAX_RECORDS: usize = 10_000;
pub const DEFAULT_LOG_INTERVAL_SECONDS: u64 = 300;

impl MetricsCollector {
    pub fn new(max_records: usize) -> Self {
        let mut data_type_metrics = HashMap::new();
        for dt in DataType::ALL {
            data_type_metrics.insert(dt, DataTypeMetrics::default());
        }
        Self {
            max_records,
            log_interval_seconds: DEFAULT_LOG_INTERVAL_SECONDS,
            inner: Mutex::new(CollectorInner {
                records: VecDeque::with_capacity(max_records.min(1024)),
                provider_metrics: HashMap::new(),
                data_type_metrics,
                last_summary_log: Instant::now(),
                start_time: Utc::now(),
                start_instant: Instant::now(),
            }),
        }
    }

    pub fn record_call(&self, event: CallEvent) {
        let data_type = match event.data_type {
            Some(dt) => dt,
            None => return,
        };

        let result = if event.cache_hit {
            CallResult::CacheHit
        } else if event.timeout {
            CallResult::Timeout
        } else if event.rate_limited {
            CallResult::RateLimited
        } else if !event.success {
            CallResult::Failure
        } else if event.fallback_used {
            CallResult::Fallback
        } else {
            CallResult::Success
        };

        let now = Utc::now();
        let record = CallRecord {
            timestamp: now,
            data_type,
            symbol: event.symbol.to_uppercase(),
            providers_tried: event.providers_tried.clone(),
            provider_used: event.provider_used.clone(),
            result,
            cache_hit: event.cache_hit,
            latency_ms: event.latency_ms,
            fallback_used: event.fallback_used,
            error_type: event.error_type.clone(),
            error_message: event.error_message.clone(),
        };

        let summary = {
            let mut inner = self.inner.lock();

            if inner.records.len() >= self.max_records {
                inner.records.pop_front();
            }
            inner.records.push_back(record.clone());

            let dt_metrics = inner.data_type_metrics.entry(data_type).or_default();
            dt_metrics.total_calls += 1;
            if event.cache_hit {
                dt_metrics.cache_hits += 1;
            } else {
                dt_metrics.cache_misses += 1;
            }
            if event.fallback_used {
                dt_metrics.fallback_used += 1;
            }
            if !event.success {
                dt_metrics.failures += 1;
            }

            for provider in &event.providers_tried {
                let pm = inner
                    .provider_metrics
                    .entry(provider.clone())
                    .or_default();
                pm.total_calls += 1;

                let served = event.provider_used.as_deref() == Some(provider.as_str());
                if served && event.success {
                    pm.successful_calls += 1;
                    pm.total_latency_ms += event.latency_ms;
                    pm.min_latency_ms = Some(match pm.min_latency_ms {
                        Some(min) => min.min(event.latency_ms),
                        None => event.latency_ms,
                    });
                    pm.max_latency_ms = pm.max_latency_ms.max(event.latency_ms);
                    pm.last_success_time = Some(now);
                } else if !served {
                    // Tried but another provider (or nobody) served
                    pm.failed_calls += 1;
                    if event.timeout {
                        pm.timeout_calls += 1;
                    }
                    if event.rate_limited {
                        pm.rate_limited_calls += 1;
                    }
                    pm.last_error = Some(
                        event
                            .error_type
                            .clone()
                            .unwrap_or_else(|| "unknown".to_string()),
                    );
                    pm.last_error_time = Some(now);
                }
            }

            if inner.last_summary_log.elapsed().as_secs() >= self.log_interval_seconds {
                inner.last_summary_log = Instant::now();
                Some(self.summary_stats_locked(&inner))
            } else {
                None
            }
        };

        // Structured per-record line: info for failures, debug otherwise
        if record.result.is_error() {
            info!(target: "market_metrics", record = %record.to_json(), "market_data_call");
        } else {
            debug!(target: "market_metrics", record = %record.to_json(), "market_data_call");
        }
        if let Some(summary) = summary {
            info!(target: "market_metrics", summary = %summary, "market_data_summary");
        }
    }

    fn summary_stats_locked(&self, inner: &CollectorInner) -> Value {
        let total_calls: u64 = inner.data_type_metrics.values().map(|m| m.total_calls).sum();
        let cache_hits: u64 = inner.data_type_metrics.values().map(|m| m.cache_hits).sum();
        let failures: u64 = inner.data_type_metrics.values().map(|m| m.failures).sum();

        let providers: HashMap<&String, Value> = inner
            .provider_metrics
            .iter()
            .map(|(name, pm)| {
                (
                    name,
                    json!({
                        "success_rate": round2(pm.success_rate()),
                        "avg_latency_ms": round2(pm.avg_latency_ms()),
                    }),
                )
            })
            .collect();

        json!({
            "uptime_hours": round2(inner.start_instant.elapsed().as_secs_f64() / 3600.0),
            "total_calls": total_calls,
            "cache_hit_rate": rate(cache_hits, total_calls),
            "failure_rate": rate(failures, total_calls),
            "providers": providers,
        })
    }

    /// Full stats payload (stable JSON schema).
    pub fn get_stats(&self) -> Value {
        let inner = self.inner.lock();

        let total_calls: u64 = inner.data_type_metrics.values().map(|m| m.total_calls).sum();
        let cache_hits: u64 = inner.data_type_metrics.values().map(|m| m.cache_hits).sum();
        let failures: u64 = inner.data_type_metrics.values().map(|m| m.failures).sum();
        let fallbacks: u64 = inner
            .data_type_metrics
            .values()
            .map(|m| m.fallback_used)
            .sum();

        let recent_errors: Vec<Value> = inner
            .records
            .iter()
            .filter(|r| r.result.is_error())
            .map(|r| r.to_json())
            .collect();
        let recent_errors = recent_errors
            .into_iter()
            .rev()
            .take(50)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>();

        json!({
            "uptime": {
                "start_time": inner.start_time.to_rfc3339(),
                "uptime_seconds": inner.start_instant.elapsed().as_secs_f64(),
            },
            "totals": {
                "total_calls": total_calls,
                "cache_hits": cache_hits,
                "cache_hit_rate": rate(cache_hits, total_calls),
                "failures": failures,
                "failure_rate": rate(failures, total_calls),
                "fallback_used": fallbacks,
                "fallback_rate": rate(fallbacks, total_calls),
            },
            "by_provider": inner
                .provider_metrics
                .iter()
                .map(|(name, pm)| (name.clone(), pm.to_json()))
                .collect::<HashMap<String, Value>>(),
            "by_data_type": inner
                .data_type_metrics
                .iter()
                .map(|(dt, m)| (dt.as_str().to_string(), m.to_json()))
                .collect::<HashMap<String, Value>>(),
            "recent_errors": recent_errors,
            "buffer_size": inner.records.len(),
        })
    }

    /// Health classification for one provider: >= 95% success rate is
    /// healthy, >= 80% degraded, else unhealthy.
    pub fn get_provider_health(&self, provider_name: &str) -> Value {
        let inner = self.inner.lock();
        let pm = match inner.provider_metrics.get(provider_name) {
            Some(pm) => pm,
            None => {
                return json!({"status": "unknown", "message": "No data for this provider"});
            }
        };

        let status = if pm.total_calls == 0 {
            "unknown"
        } else if pm.success_rate() >= 95.0 {
            "healthy"
        } else if pm.success_rate() >= 80.0 {
            "degraded"
        } else {
            "unhealthy"
        };

        let recent_errors: Vec<Value> = inner
            .records
            .iter()
            .rev()
            .filter(|r| {
                r.result.is_error() && r.providers_tried.iter().any(|p| p == provider_name)
            })
            .take(10)
            .map(|r| r.to_json())
            .collect();

        json!({
            "status": status,
            "metrics": pm.to_json(),
            "recent_errors": recent_errors,
        })
    }

    /// Recent call records, newest last, with optional filters.
    pub fn get_recent_calls(
        &self,
        limit: usize,
        data_type: Option<DataType>,
        provider: Option<&str>,
        symbol: Option<&str>,
        errors_only: bool,
    ) -> Vec<Value> {
        let inner = self.inner.lock();
        let symbol_upper = symbol.map(|s| s.to_uppercase());

        let matching: Vec<&CallRecord> = inner
            .records
            .iter()
            .filter(|r| data_type.map_or(true, |dt| r.data_type == dt))
            .filter(|r| {
                provider.map_or(true, |p| r.providers_tried.iter().any(|t| t == p))
            })
            .filter(|r| symbol_upper.as_deref().map_or(true, |s| r.symbol == s))
            .filter(|r| !errors_only || r.result.is_error())
            .collect();

        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).map(|r| r.to_json()).collect()
    }

    /// Latency percentiles over successful (non-cache-hit) records.
    pub fn get_latency_percentiles(
        &self,
        provider: Option<&str>,
        data_type: Option<DataType>,
    ) -> Value {
        let inner = self.inner.lock();
        let mut latencies: Vec<f64> = inner
            .records
            .iter()
            .filter(|r| matches!(r.result, CallResult::Success | CallResult::Fallback))
            .filter(|r| provider.map_or(true, |p| r.provider_used.as_deref() == Some(p)))
            .filter(|r| data_type.map_or(true, |dt| r.data_type == dt))
            .map(|r| r.latency_ms)
            .collect();

        if latencies.is_empty() {
            return json!({"p50": 0.0, "p90": 0.0, "p95": 0.0, "p99": 0.0});
        }

        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = latencies.len();
        let pick = |p: f64| {
            let idx = ((n as f64 * p) as usize).min(n - 1);
            round2(latencies[idx])
        };

        json!({
            "p50": pick(0.50),
            "p90": pick(0.90),
            "p95": pick(0.95),
            "p99": pick(0.99),
        })
    }

    pub fn buffer_len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Reset all metrics (tests only).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.records.clear();
        inner.provider_metrics.clear();
        for dt in DataType::ALL {
            inner.data_type_metrics.insert(dt, DataTypeMetrics::default());
        }
        inner.start_time = Utc::now();
        inner.start_instant = Instant::now();
    }
}

fn rate(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(part as f64 / total as f64 * 100.0)
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORDS)
    }
}

//! Market-data router scenarios: failover, dedup fan-in, circuit
//! recovery, rate-limit deprioritization.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use marketmind_backend::config::{AppConfig, ProviderSettings};
use marketmind_backend::market::errors::ProviderError;
use marketmind_backend::market::guard::{CircuitState, ProviderGuard};
use marketmind_backend::market::provider::{
    guard_health, HistoryRange, MarketDataProvider, ProviderResult,
};
use marketmind_backend::market::types::{
    CompanyInfo, DataType, FundamentalsData, HistorySeries, MarketKind, ProviderStatus, QuoteData,
};
use marketmind_backend::market::MarketDataService;

const QUOTE_ONLY: [DataType; 1] = [DataType::Quote];
const US_ONLY: [MarketKind; 1] = [MarketKind::Us];

/// What a scripted call should do.
#[derive(Clone)]
enum Step {
    Price(f64),
    SlowPrice(f64, Duration),
    RateLimited,
    Network,
    NoData,
}

struct MockAdapter {
    name: String,
    guard: ProviderGuard,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Arc<AtomicUsize>,
}

impl MockAdapter {
    fn new(name: &str, settings: &ProviderSettings, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            guard: ProviderGuard::new(settings),
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn push_steps(&self, steps: &[Step]) {
        self.script.lock().extend(steps.iter().cloned());
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl MarketDataProvider for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }
    fn supported_data_types(&self) -> &[DataType] {
        &QUOTE_ONLY
    }
    fn supported_markets(&self) -> &[MarketKind] {
        &US_ONLY
    }

    async fn get_quote(&self, symbol: &str) -> ProviderResult<QuoteData> {
        let symbol = symbol.to_string();
        self.guard
            .run(async {
                self.calls.fetch_add(1, Ordering::SeqCst);
                match self.next_step() {
                    Step::Price(price) => Ok(Some(QuoteData {
                        symbol: symbol.clone(),
                        current_price: price,
                        previous_close: None,
                        open_price: None,
                        day_high: None,
                        day_low: None,
                        volume: None,
                        market_cap: None,
                        timestamp: None,
                        source: self.name.clone(),
                    })),
                    Step::SlowPrice(price, delay) => {
                        tokio::time::sleep(delay).await;
                        Ok(Some(QuoteData {
                            symbol: symbol.clone(),
                            current_price: price,
                            previous_close: None,
                            open_price: None,
                            day_high: None,
                            day_low: None,
                            volume: None,
                            market_cap: None,
                            timestamp: None,
                            source: self.name.clone(),
                        }))
                    }
                    Step::RateLimited => Err(ProviderError::RateLimited(
                        "HTTP 429 Too Many Requests".to_string(),
                    )),
                    Step::Network => {
                        Err(ProviderError::Network("connection reset".to_string()))
                    }
                    Step::NoData => Ok(None),
                }
            })
            .await
    }

    async fn get_history(
        &self,
        _symbol: &str,
        _range: &HistoryRange,
    ) -> ProviderResult<HistorySeries> {
        Ok(None)
    }
    async fn get_info(&self, _symbol: &str) -> ProviderResult<CompanyInfo> {
        Ok(None)
    }
    async fn get_fundamentals(&self, _symbol: &str) -> ProviderResult<FundamentalsData> {
        Ok(None)
    }

    fn health_check(&self) -> ProviderStatus {
        guard_health(&self.guard)
    }
    fn is_rate_limited(&self) -> bool {
        self.guard.is_rate_limited()
    }
    fn is_circuit_open(&self) -> bool {
        self.guard.is_circuit_open()
    }
    fn circuit_state(&self) -> CircuitState {
        self.guard.circuit_state()
    }
    fn active_requests(&self) -> usize {
        self.guard.active_requests()
    }
    fn consecutive_failures(&self) -> u32 {
        self.guard.consecutive_failures()
    }
}

fn service() -> MarketDataService {
    MarketDataService::new(&AppConfig::default())
}

fn settings(name: &str, priority: i64) -> ProviderSettings {
    ProviderSettings {
        name: name.to_string(),
        priority,
        ..Default::default()
    }
}

#[tokio::test]
async fn failover_to_secondary_on_rate_limit() {
    let service = service();

    let p1_settings = settings("P1", 10);
    let p1 = MockAdapter::new("P1", &p1_settings, Step::RateLimited);
    let p2_settings = settings("P2", 20);
    let p2 = MockAdapter::new("P2", &p2_settings, Step::Price(420.50));

    service.register_adapter_with_settings(p1.clone(), p1_settings);
    service.register_adapter_with_settings(p2.clone(), p2_settings);

    let quote = service.get_quote("MSFT", None).await.unwrap();
    assert_eq!(quote.current_price, 420.50);
    assert_eq!(quote.source, "P2");

    // P1 was tried first, failed, and entered cooldown
    assert_eq!(p1.call_count(), 1);
    assert_eq!(p2.call_count(), 1);
    assert!(p1.is_rate_limited());

    let metrics = service.get_metrics();
    assert_eq!(metrics["by_provider"]["P1"]["failed_calls"], 1);
    assert_eq!(metrics["by_provider"]["P2"]["successful_calls"], 1);
    assert_eq!(metrics["totals"]["fallback_used"], 1);

    let calls = service.get_recent_calls(10, None, None, None, false);
    let last = calls.last().unwrap();
    assert_eq!(last["providers_tried"], serde_json::json!(["P1", "P2"]));
    assert_eq!(last["provider_used"], "P2");
    assert_eq!(last["fallback_used"], true);
}

#[tokio::test]
async fn rate_limited_provider_is_deprioritized_not_excluded() {
    let service = service();

    let p1_settings = settings("P1", 10);
    let p1 = MockAdapter::new("P1", &p1_settings, Step::Price(1.0));
    p1.push_steps(&[Step::RateLimited]);
    let p2_settings = settings("P2", 20);
    let p2 = MockAdapter::new("P2", &p2_settings, Step::Price(2.0));

    service.register_adapter_with_settings(p1.clone(), p1_settings);
    service.register_adapter_with_settings(p2.clone(), p2_settings);

    // First call: P1 throttles, P2 serves
    let quote = service.get_quote("AAPL", None).await.unwrap();
    assert_eq!(quote.source, "P2");
    assert!(p1.is_rate_limited());

    service.clear_cache(None);

    // While P1 cools down, P2 is preferred even though P1 is cheaper
    let quote = service.get_quote("AAPL", None).await.unwrap();
    assert_eq!(quote.source, "P2");
    assert_eq!(p1.call_count(), 1, "cooled-down provider not tried while P2 succeeds");
}

#[tokio::test]
async fn all_providers_failed_returns_none() {
    let service = service();
    let p1_settings = settings("P1", 10);
    let p1 = MockAdapter::new("P1", &p1_settings, Step::Network);
    service.register_adapter_with_settings(p1.clone(), p1_settings);

    assert!(service.get_quote("MSFT", None).await.is_none());

    let errors = service.get_recent_calls(10, None, None, None, true);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["provider_used"], serde_json::Value::Null);
}

#[tokio::test]
async fn unsupported_market_is_not_routed() {
    let service = service();
    let p1_settings = settings("P1", 10);
    let p1 = MockAdapter::new("P1", &p1_settings, Step::Price(1.0));
    service.register_adapter_with_settings(p1.clone(), p1_settings);

    // US-only adapter never sees an A-share symbol
    assert!(service.get_quote("600519", None).await.is_none());
    assert_eq!(p1.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fifty_concurrent_callers_one_underlying_call() {
    let service = service();
    let p1_settings = settings("P1", 10);
    let p1 = MockAdapter::new(
        "P1",
        &p1_settings,
        Step::SlowPrice(500.0, Duration::from_millis(80)),
    );
    service.register_adapter_with_settings(p1.clone(), p1_settings);

    let mut handles = Vec::new();
    for _ in 0..50 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service.get_quote("NVDA", None).await.unwrap().current_price
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), 500.0);
    }

    assert_eq!(p1.call_count(), 1, "dedup coalesces identical requests");

    let metrics = service.get_metrics();
    assert_eq!(metrics["totals"]["total_calls"], 50);
    assert_eq!(metrics["by_provider"]["P1"]["total_calls"], 1);
}

#[tokio::test]
async fn cache_hit_skips_providers() {
    let service = service();
    let p1_settings = settings("P1", 10);
    let p1 = MockAdapter::new("P1", &p1_settings, Step::Price(7.0));
    service.register_adapter_with_settings(p1.clone(), p1_settings);

    assert!(service.get_quote("AAPL", None).await.is_some());
    assert!(service.get_quote("AAPL", None).await.is_some());
    assert_eq!(p1.call_count(), 1);

    let metrics = service.get_metrics();
    assert_eq!(metrics["totals"]["cache_hits"], 1);

    service.clear_cache(Some("AAPL"));
    assert!(service.get_quote("AAPL", None).await.is_some());
    assert_eq!(p1.call_count(), 2);
}

#[tokio::test]
async fn circuit_opens_then_recovers() {
    let service = service();
    let mut a_settings = settings("A", 10);
    a_settings.circuit_failure_threshold = 3;
    a_settings.cooldown_on_error_seconds = 2;
    a_settings.circuit_success_threshold = 2;
    // Keep the failure counter from tripping the rate-limit cooldown first
    a_settings.max_consecutive_failures = 100;

    let a = MockAdapter::new("A", &a_settings, Step::Price(10.0));
    a.push_steps(&[Step::Network, Step::Network, Step::Network]);
    service.register_adapter_with_settings(a.clone(), a_settings);

    // Three classified failures open the circuit
    for _ in 0..3 {
        assert!(service.get_quote("MSFT", None).await.is_none());
    }
    assert!(a.is_circuit_open());
    assert_eq!(a.call_count(), 3);

    // While open, the router skips the adapter entirely
    assert!(service.get_quote("MSFT", None).await.is_none());
    assert_eq!(a.call_count(), 3);

    // After the timeout, one access flips to half-open and probes pass
    tokio::time::sleep(Duration::from_millis(2100)).await;
    let quote = service.get_quote("MSFT", None).await.unwrap();
    assert_eq!(quote.current_price, 10.0);
    assert_eq!(a.circuit_state(), CircuitState::HalfOpen);

    service.clear_cache(None);
    assert!(service.get_quote("MSFT", None).await.is_some());
    assert_eq!(a.circuit_state(), CircuitState::Closed);

    service.clear_cache(None);
    let quote = service.get_quote("MSFT", None).await.unwrap();
    assert_eq!(quote.source, "A", "recovered adapter routes first again");
}

#[tokio::test]
async fn disabled_provider_is_never_considered() {
    let service = service();
    let mut p1_settings = settings("P1", 10);
    p1_settings.enabled = false;
    let p1 = MockAdapter::new("P1", &p1_settings, Step::Price(1.0));
    service.register_adapter_with_settings(p1.clone(), p1_settings);

    assert!(service.get_quote("AAPL", None).await.is_none());
    assert_eq!(p1.call_count(), 0);
}

#[tokio::test]
async fn provider_status_surface() {
    let service = service();
    let p1_settings = settings("P1", 10);
    let p1 = MockAdapter::new("P1", &p1_settings, Step::Price(1.0));
    service.register_adapter_with_settings(p1, p1_settings);

    let status = service.get_provider_status();
    assert_eq!(status["P1"]["enabled"], true);
    assert_eq!(status["P1"]["priority"], 10);
    assert_eq!(status["P1"]["health"], "healthy");
    assert_eq!(status["P1"]["supported_data_types"], serde_json::json!(["quote"]));

    let stats = service.get_stats();
    assert!(stats["cache"].is_object());
    assert!(stats["deduplication"].is_object());
    assert!(stats["metrics"]["uptime"].is_object());
}

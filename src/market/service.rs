//! Central market-data router.
//!
//! One entry point per data type. Each call consults the cache, joins any
//! identical in-flight request, then walks the eligible adapters in
//! priority order until one returns data. Every call lands in the
//! metrics collector.

use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::cache::MarketCache;
use super::dedup::{make_dedup_key, DedupOutcome, RequestDeduplicator};
use super::detector::detect_market;
use super::errors::ProviderError;
use super::metrics::{CallEvent, MetricsCollector};
use super::provider::{HistoryRange, MarketDataProvider};
use super::types::{
    merge_flat_json, CachedValue, CompanyInfo, DataType, EarningsData, FundamentalsData,
    HistorySeries, MarketKind, OptionsChain, ProviderStatus, QuoteData,
};
use crate::config::{AppConfig, ProviderSettings};

type AdapterFuture =
    Pin<Box<dyn Future<Output = Result<Option<CachedValue>, ProviderError>> + Send>>;

/// Coerce a concrete adapter-call future into the boxed form the router
/// iterates over.
fn boxed<F>(fut: F) -> AdapterFuture
where
    F: Future<Output = Result<Option<CachedValue>, ProviderError>> + Send + 'static,
{
    Box::pin(fut)
}

struct ServiceInner {
    adapters: RwLock<Vec<Arc<dyn MarketDataProvider>>>,
    settings: RwLock<HashMap<String, ProviderSettings>>,
    cache: MarketCache,
    dedup: RequestDeduplicator,
    metrics: Arc<MetricsCollector>,
}

/// Unified data-access service over all registered providers.
#[derive(Clone)]
pub struct MarketDataService {
    inner: Arc<ServiceInner>,
}

impl MarketDataService {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                adapters: RwLock::new(Vec::new()),
                settings: RwLock::new(config.providers.clone()),
                cache: MarketCache::new(&config.cache),
                dedup: RequestDeduplicator::new(&config.dedup),
                metrics: Arc::new(MetricsCollector::default()),
            }),
        }
    }

    /// Build the service with the full default adapter set.
    pub fn with_default_adapters(config: &AppConfig, dataset_path: &str) -> Self {
        use super::adapters::{
            AlphaVantageAdapter, LocalDatasetAdapter, SinaCommodityAdapter, TigerAdapter,
            TushareAdapter, YahooAdapter,
        };

        let service = Self::new(config);
        service.register_adapter(Arc::new(YahooAdapter::new(&config.provider("yahoo"))));
        service.register_adapter(Arc::new(LocalDatasetAdapter::open(
            dataset_path,
            &config.provider("dataset"),
        )));
        service.register_adapter(Arc::new(TigerAdapter::new(
            &config.provider("tiger"),
            &config.credentials,
        )));
        service.register_adapter(Arc::new(AlphaVantageAdapter::new(
            &config.provider("alphavantage"),
            config.credentials.alpha_vantage_key.clone(),
        )));
        service.register_adapter(Arc::new(TushareAdapter::new(
            &config.provider("tushare"),
            config.credentials.tushare_token.clone(),
        )));
        service.register_adapter(Arc::new(SinaCommodityAdapter::new(
            &config.provider("sina_commodity"),
        )));
        info!("market data service initialized");
        service
    }

    pub fn register_adapter(&self, adapter: Arc<dyn MarketDataProvider>) {
        info!(provider = adapter.name(), "registered provider");
        self.inner.adapters.write().push(adapter);
    }

    /// Register an adapter together with explicit router settings
    /// (priority, enablement, TTLs).
    pub fn register_adapter_with_settings(
        &self,
        adapter: Arc<dyn MarketDataProvider>,
        settings: ProviderSettings,
    ) {
        self.inner
            .settings
            .write()
            .insert(adapter.name().to_string(), settings);
        self.register_adapter(adapter);
    }

    fn settings_for(&self, name: &str) -> ProviderSettings {
        self.inner
            .settings
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| ProviderSettings::named(name))
    }

    /// Candidate adapters for (data type, market, symbol), priority
    /// ordered. Rate-limited adapters are deprioritized (+1000) but kept;
    /// open circuits and unavailable adapters are excluded.
    fn providers_for(
        &self,
        data_type: DataType,
        market: MarketKind,
        symbol: &str,
    ) -> Vec<Arc<dyn MarketDataProvider>> {
        let adapters = self.inner.adapters.read();
        let mut candidates: Vec<(i64, Arc<dyn MarketDataProvider>)> = Vec::new();

        for adapter in adapters.iter() {
            let settings = self.settings_for(adapter.name());
            if !settings.enabled {
                continue;
            }
            if !adapter.supported_data_types().contains(&data_type) {
                continue;
            }
            if !adapter.supported_markets().contains(&market) {
                continue;
            }
            if !adapter.supports_symbol(symbol) {
                continue;
            }
            if adapter.is_circuit_open() {
                continue;
            }
            if adapter.health_check() == ProviderStatus::Unavailable {
                continue;
            }

            let mut priority = settings.priority;
            if adapter.is_rate_limited() {
                priority += 1000;
            }
            candidates.push((priority, Arc::clone(adapter)));
        }

        candidates.sort_by_key(|(priority, _)| *priority);
        candidates.into_iter().map(|(_, a)| a).collect()
    }

    /// The shared fetch pipeline: cache, dedup, then priority failover.
    async fn fetch_routed<F>(
        &self,
        data_type: DataType,
        symbol: &str,
        market: Option<MarketKind>,
        cache_key: String,
        dedup_params: Vec<(&str, Option<String>)>,
        call: F,
    ) -> Option<CachedValue>
    where
        F: Fn(Arc<dyn MarketDataProvider>, String) -> AdapterFuture + Send + Sync,
    {
        let market = market.unwrap_or_else(|| detect_market(symbol));
        let start = Instant::now();

        if let Some(cached) = self.inner.cache.get(&cache_key, data_type) {
            self.inner.metrics.record_call(CallEvent {
                data_type: Some(data_type),
                symbol: symbol.to_string(),
                latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                cache_hit: true,
                success: true,
                ..Default::default()
            });
            return Some(cached);
        }

        let dedup_key = make_dedup_key(data_type.as_str(), symbol, &dedup_params);
        let fetch = self.try_providers(data_type, market, symbol, &cache_key, start, &call);

        let (result, outcome) = self.inner.dedup.execute(dedup_key, fetch).await;

        match result {
            Ok(shared) => {
                if outcome == DedupOutcome::Joined {
                    // Joined callers get their own record, but with no
                    // providers_tried so provider aggregates stay exact.
                    self.inner.metrics.record_call(CallEvent {
                        data_type: Some(data_type),
                        symbol: symbol.to_string(),
                        latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                        success: shared.is_ok(),
                        error_message: shared.as_ref().err().cloned(),
                        ..Default::default()
                    });
                }
                shared.ok().flatten()
            }
            Err(_) => {
                self.inner.metrics.record_call(CallEvent {
                    data_type: Some(data_type),
                    symbol: symbol.to_string(),
                    latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                    success: false,
                    timeout: true,
                    error_type: Some("timeout".to_string()),
                    error_message: Some("timed out waiting for in-flight request".to_string()),
                    ..Default::default()
                });
                None
            }
        }
    }

    /// Walk candidates in priority order until one yields data.
    async fn try_providers<F>(
        &self,
        data_type: DataType,
        market: MarketKind,
        symbol: &str,
        cache_key: &str,
        start: Instant,
        call: &F,
    ) -> Result<Option<CachedValue>, String>
    where
        F: Fn(Arc<dyn MarketDataProvider>, String) -> AdapterFuture + Send + Sync,
    {
        let candidates = self.providers_for(data_type, market, symbol);
        let mut providers_tried: Vec<String> = Vec::new();
        let mut last_error: Option<ProviderError> = None;

        for (index, adapter) in candidates.iter().enumerate() {
            let name = adapter.name().to_string();
            providers_tried.push(name.clone());

            let fetch_start = Instant::now();
            match call(Arc::clone(adapter), symbol.to_string()).await {
                Ok(Some(value)) => {
                    let elapsed = fetch_start.elapsed().as_secs_f64() * 1000.0;
                    debug!(
                        data_type = data_type.as_str(),
                        symbol,
                        provider = name,
                        elapsed_ms = elapsed,
                        "provider served request"
                    );

                    let ttl = self.settings_for(&name).cache_ttl.ttl_for(data_type);
                    self.inner
                        .cache
                        .set(cache_key, value.clone(), data_type, ttl, &name);

                    self.inner.metrics.record_call(CallEvent {
                        data_type: Some(data_type),
                        symbol: symbol.to_string(),
                        providers_tried: providers_tried.clone(),
                        provider_used: Some(name),
                        latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                        success: true,
                        fallback_used: index > 0,
                        ..Default::default()
                    });
                    return Ok(Some(value));
                }
                Ok(None) => {
                    debug!(
                        data_type = data_type.as_str(),
                        symbol,
                        provider = name,
                        "no data, trying next provider"
                    );
                }
                Err(e) => {
                    warn!(
                        data_type = data_type.as_str(),
                        symbol,
                        provider = name,
                        error = %e,
                        "provider failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let (error_type, error_message, rate_limited, timed_out) = match &last_error {
            Some(e) => (
                Some(e.error_type().to_string()),
                Some(e.to_string()),
                e.is_rate_limit(),
                matches!(e, ProviderError::ConcurrencyTimeout),
            ),
            None => (Some("all_providers_failed".to_string()), None, false, false),
        };

        self.inner.metrics.record_call(CallEvent {
            data_type: Some(data_type),
            symbol: symbol.to_string(),
            providers_tried,
            provider_used: None,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            success: false,
            error_type,
            error_message,
            rate_limited,
            timeout: timed_out,
            ..Default::default()
        });
        Ok(None)
    }

    // ============================================================================
    // Public API, one method per data type
    // ============================================================================

    pub async fn get_quote(&self, symbol: &str, market: Option<MarketKind>) -> Option<QuoteData> {
        self.fetch_routed(
            DataType::Quote,
            symbol,
            market,
            symbol.to_uppercase(),
            vec![],
            |adapter, sym| {
                boxed(async move { Ok(adapter.get_quote(&sym).await?.map(CachedValue::Quote)) })
            },
        )
        .await
        .and_then(CachedValue::as_quote)
    }

    pub async fn get_history(
        &self,
        symbol: &str,
        range: &HistoryRange,
        market: Option<MarketKind>,
    ) -> Option<HistorySeries> {
        let cache_key = format!(
            "{}:{}:{}:{}",
            symbol.to_uppercase(),
            range.period.as_deref().unwrap_or("-"),
            range.start.map(|d| d.to_string()).unwrap_or_default(),
            range.end.map(|d| d.to_string()).unwrap_or_default(),
        );
        let dedup_params = vec![
            ("period", range.period.clone()),
            ("start", range.start.map(|d| d.to_string())),
            ("end", range.end.map(|d| d.to_string())),
        ];
        let range = range.clone();
        self.fetch_routed(
            DataType::History,
            symbol,
            market,
            cache_key,
            dedup_params,
            move |adapter, sym| {
                let range = range.clone();
                boxed(async move {
                    let result = adapter.get_history(&sym, &range).await?;
                    Ok(result
                        .filter(|series| !series.is_empty())
                        .map(CachedValue::History))
                })
            },
        )
        .await
        .and_then(CachedValue::as_history)
    }

    pub async fn get_info(&self, symbol: &str, market: Option<MarketKind>) -> Option<CompanyInfo> {
        self.fetch_routed(
            DataType::Info,
            symbol,
            market,
            symbol.to_uppercase(),
            vec![],
            |adapter, sym| {
                boxed(async move { Ok(adapter.get_info(&sym).await?.map(CachedValue::Info)) })
            },
        )
        .await
        .and_then(CachedValue::as_info)
    }

    pub async fn get_fundamentals(
        &self,
        symbol: &str,
        market: Option<MarketKind>,
    ) -> Option<FundamentalsData> {
        self.fetch_routed(
            DataType::Fundamentals,
            symbol,
            market,
            symbol.to_uppercase(),
            vec![],
            |adapter, sym| {
                boxed(async move {
                    Ok(adapter
                        .get_fundamentals(&sym)
                        .await?
                        .map(CachedValue::Fundamentals))
                })
            },
        )
        .await
        .and_then(CachedValue::as_fundamentals)
    }

    pub async fn get_options_expirations(
        &self,
        symbol: &str,
        market: Option<MarketKind>,
    ) -> Option<Vec<String>> {
        self.fetch_routed(
            DataType::OptionsExpirations,
            symbol,
            market,
            symbol.to_uppercase(),
            vec![],
            |adapter, sym| {
                boxed(async move {
                    let result = adapter.get_options_expirations(&sym).await?;
                    Ok(result
                        .filter(|dates| !dates.is_empty())
                        .map(CachedValue::Expirations))
                })
            },
        )
        .await
        .and_then(CachedValue::as_expirations)
    }

    pub async fn get_options_chain(
        &self,
        symbol: &str,
        expiry: &str,
        market: Option<MarketKind>,
    ) -> Option<OptionsChain> {
        let cache_key = format!("{}:{}", symbol.to_uppercase(), expiry);
        let expiry_owned = expiry.to_string();
        self.fetch_routed(
            DataType::OptionsChain,
            symbol,
            market,
            cache_key,
            vec![("expiry", Some(expiry.to_string()))],
            move |adapter, sym| {
                let expiry = expiry_owned.clone();
                boxed(async move {
                    let result = adapter.get_options_chain(&sym, &expiry).await?;
                    Ok(result
                        .filter(|chain| !chain.is_empty())
                        .map(CachedValue::OptionsChain))
                })
            },
        )
        .await
        .and_then(CachedValue::as_options_chain)
    }

    pub async fn get_earnings(
        &self,
        symbol: &str,
        market: Option<MarketKind>,
    ) -> Option<EarningsData> {
        self.fetch_routed(
            DataType::Earnings,
            symbol,
            market,
            symbol.to_uppercase(),
            vec![],
            |adapter, sym| {
                boxed(async move {
                    let result = adapter.get_earnings(&sym).await?;
                    Ok(result
                        .filter(|earnings| !earnings.is_empty())
                        .map(CachedValue::Earnings))
                })
            },
        )
        .await
        .and_then(CachedValue::as_earnings)
    }

    /// Margin requirement rate for a symbol, from the first broker-backed
    /// adapter that has one.
    pub async fn get_margin_rate(&self, symbol: &str) -> Option<f64> {
        let adapters: Vec<Arc<dyn MarketDataProvider>> =
            self.inner.adapters.read().iter().cloned().collect();
        for adapter in adapters {
            match adapter.get_margin_rate(symbol).await {
                Ok(Some(rate)) => return Some(rate),
                Ok(None) => {}
                Err(e) => {
                    warn!(provider = adapter.name(), symbol, error = %e, "margin rate lookup failed");
                }
            }
        }
        None
    }

    // ============================================================================
    // Composed lookups
    // ============================================================================

    /// Quote + info + fundamentals merged into one flat map.
    pub async fn get_ticker_data(&self, symbol: &str) -> Value {
        let mut parts = vec![json!({"symbol": symbol})];

        if let Some(quote) = self.get_quote(symbol, None).await {
            parts.push(quote.to_flat_json());
        }
        if let Some(info) = self.get_info(symbol, None).await {
            parts.push(info.to_flat_json());
        }
        if let Some(fundamentals) = self.get_fundamentals(symbol, None).await {
            parts.push(fundamentals.to_flat_json());
        }

        merge_flat_json(&parts)
    }

    /// History as a bar table; empty when no provider has data.
    pub async fn get_history_df(&self, symbol: &str, range: &HistoryRange) -> HistorySeries {
        match self.get_history(symbol, range, None).await {
            Some(series) => series,
            None => HistorySeries {
                symbol: symbol.to_uppercase(),
                bars: Vec::new(),
                period: range.period.clone(),
                start_date: range.start,
                end_date: range.end,
                source: String::new(),
            },
        }
    }

    // ============================================================================
    // Operational surface
    // ============================================================================

    pub fn clear_cache(&self, symbol: Option<&str>) {
        match symbol {
            Some(s) => {
                self.inner.cache.clear_for_symbol(s);
            }
            None => self.inner.cache.clear(),
        }
    }

    pub fn get_provider_status(&self) -> Value {
        let adapters = self.inner.adapters.read();
        let mut status = serde_json::Map::new();
        for adapter in adapters.iter() {
            let settings = self.settings_for(adapter.name());
            status.insert(
                adapter.name().to_string(),
                json!({
                    "health": adapter.health_check().as_str(),
                    "enabled": settings.enabled,
                    "priority": settings.priority,
                    "rate_limited": adapter.is_rate_limited(),
                    "circuit_state": adapter.circuit_state().as_str(),
                    "active_requests": adapter.active_requests(),
                    "supported_data_types": adapter
                        .supported_data_types()
                        .iter()
                        .map(|dt| dt.as_str())
                        .collect::<Vec<_>>(),
                    "supported_markets": adapter
                        .supported_markets()
                        .iter()
                        .map(|m| m.as_str())
                        .collect::<Vec<_>>(),
                }),
            );
        }
        Value::Object(status)
    }

    pub fn get_stats(&self) -> Value {
        json!({
            "cache": self.inner.cache.stats().to_json(),
            "deduplication": self.inner.dedup.stats().to_json(),
            "providers": self.get_provider_status(),
            "metrics": self.inner.metrics.get_stats(),
        })
    }

    pub fn get_metrics(&self) -> Value {
        self.inner.metrics.get_stats()
    }

    pub fn get_provider_health(&self, provider_name: &str) -> Value {
        self.inner.metrics.get_provider_health(provider_name)
    }

    pub fn get_latency_percentiles(
        &self,
        provider: Option<&str>,
        data_type: Option<DataType>,
    ) -> Value {
        self.inner.metrics.get_latency_percentiles(provider, data_type)
    }

    pub fn get_recent_calls(
        &self,
        limit: usize,
        data_type: Option<DataType>,
        provider: Option<&str>,
        symbol: Option<&str>,
        errors_only: bool,
    ) -> Vec<Value> {
        self.inner
            .metrics
            .get_recent_calls(limit, data_type, provider, symbol, errors_only)
    }

    pub fn metrics_collector(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.inner.metrics)
    }
}

//! The uniform provider interface.
//!
//! Every market-data source implements this trait. Fetch methods return
//! `Ok(None)` for "no data" and `Err` only for classified failures, so
//! the router can fail over cleanly. Health state is owned by the
//! adapter (via its [`ProviderGuard`](super::guard::ProviderGuard)); the
//! router reads but never mutates it.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};

use super::errors::ProviderError;
use super::guard::CircuitState;
use super::types::{
    CompanyInfo, DataType, EarningsData, FundamentalsData, HistorySeries, MarketKind,
    OptionsChain, ProviderStatus, QuoteData,
};

/// History request window: either a named period or an explicit range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryRange {
    /// Period string (1d, 5d, 1mo, 3mo, 6mo, 1y, 2y, 5y, max)
    pub period: Option<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl HistoryRange {
    pub fn period(period: &str) -> Self {
        Self {
            period: Some(period.to_string()),
            ..Default::default()
        }
    }
}

pub type ProviderResult<T> = Result<Option<T>, ProviderError>;

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Provider name for logging, metrics and config lookup.
    fn name(&self) -> &str;

    fn supported_data_types(&self) -> &[DataType];

    fn supported_markets(&self) -> &[MarketKind];

    /// Whether this provider can serve the given symbol. Default accepts
    /// everything; adapters override for special cases (macro tickers,
    /// futures).
    fn supports_symbol(&self, _symbol: &str) -> bool {
        true
    }

    async fn get_quote(&self, symbol: &str) -> ProviderResult<QuoteData>;

    async fn get_history(&self, symbol: &str, range: &HistoryRange) -> ProviderResult<HistorySeries>;

    async fn get_info(&self, symbol: &str) -> ProviderResult<CompanyInfo>;

    async fn get_fundamentals(&self, symbol: &str) -> ProviderResult<FundamentalsData>;

    async fn get_options_expirations(&self, _symbol: &str) -> ProviderResult<Vec<String>> {
        Ok(None)
    }

    async fn get_options_chain(&self, _symbol: &str, _expiry: &str) -> ProviderResult<OptionsChain> {
        Ok(None)
    }

    async fn get_earnings(&self, _symbol: &str) -> ProviderResult<EarningsData> {
        Ok(None)
    }

    /// Margin requirement rate as a decimal (0.25 = 25%). Broker-backed
    /// adapters override this; everyone else has no margin data.
    async fn get_margin_rate(&self, _symbol: &str) -> ProviderResult<f64> {
        Ok(None)
    }

    /// Self-reported health.
    fn health_check(&self) -> ProviderStatus;

    fn is_rate_limited(&self) -> bool;

    fn is_circuit_open(&self) -> bool;

    fn circuit_state(&self) -> CircuitState;

    fn active_requests(&self) -> usize;

    fn consecutive_failures(&self) -> u32;

    /// Detailed status for monitoring surfaces.
    fn status_info(&self) -> Value {
        json!({
            "health": self.health_check().as_str(),
            "rate_limited": self.is_rate_limited(),
            "circuit_state": self.circuit_state().as_str(),
            "active_requests": self.active_requests(),
            "consecutive_failures": self.consecutive_failures(),
        })
    }
}

/// Default health logic shared by adapters that own a guard: an open
/// circuit dominates, then cooldown, then degraded-on-failures.
pub fn guard_health(guard: &super::guard::ProviderGuard) -> ProviderStatus {
    if guard.is_circuit_open() {
        return ProviderStatus::Unavailable;
    }
    if guard.is_rate_limited() {
        return ProviderStatus::RateLimited;
    }
    if guard.consecutive_failures() > 0 {
        return ProviderStatus::Degraded;
    }
    ProviderStatus::Healthy
}

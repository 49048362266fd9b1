//! Rate-limited public API adapter (fundamentals fallback).
//!
//! Free tier allows 5 requests/minute, so this source sits late in the
//! priority order and caches aggressively. The API signals throttling
//! in-band with a "Note" field on an HTTP 200 response.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use tracing::debug;

use super::{build_client, field_str, http_get_json, value_f64, value_i64};
use crate::config::ProviderSettings;
use crate::market::errors::ProviderError;
use crate::market::guard::{CircuitState, ProviderGuard};
use crate::market::provider::{guard_health, HistoryRange, MarketDataProvider, ProviderResult};
use crate::market::types::{
    CompanyInfo, DataType, FundamentalsData, HistoryBar, HistorySeries, MarketKind,
    ProviderStatus, QuoteData,
};

const API_BASE: &str = "https://www.alphavantage.co/query";

const SUPPORTED_DATA_TYPES: [DataType; 4] = [
    DataType::Quote,
    DataType::History,
    DataType::Info,
    DataType::Fundamentals,
];
const SUPPORTED_MARKETS: [MarketKind; 1] = [MarketKind::Us];

pub struct AlphaVantageAdapter {
    name: String,
    client: reqwest::Client,
    api_key: Option<String>,
    guard: ProviderGuard,
}

impl AlphaVantageAdapter {
    pub fn new(settings: &ProviderSettings, api_key: Option<String>) -> Self {
        Self {
            name: settings.name.clone(),
            client: build_client(),
            api_key,
            guard: ProviderGuard::new(settings),
        }
    }

    async fn query(&self, function: &str, symbol: &str) -> Result<Value, ProviderError> {
        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ProviderError::Other("api key not configured".into()))?;

        let body = http_get_json(
            &self.client,
            API_BASE,
            &[
                ("function", function.to_string()),
                ("symbol", symbol.to_string()),
                ("apikey", key.clone()),
            ],
        )
        .await?;

        // Throttling arrives as a 200 with a "Note"/"Information" field
        if let Some(note) = field_str(&body, "Note").or_else(|| field_str(&body, "Information")) {
            return Err(ProviderError::RateLimited(note));
        }
        if let Some(err) = field_str(&body, "Error Message") {
            return Err(ProviderError::from_message(&format!(
                "invalid symbol {symbol}: {err}"
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl MarketDataProvider for AlphaVantageAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_data_types(&self) -> &[DataType] {
        &SUPPORTED_DATA_TYPES
    }

    fn supported_markets(&self) -> &[MarketKind] {
        &SUPPORTED_MARKETS
    }

    fn supports_symbol(&self, symbol: &str) -> bool {
        self.api_key.is_some() && !symbol.starts_with('^')
    }

    async fn get_quote(&self, symbol: &str) -> ProviderResult<QuoteData> {
        let symbol = symbol.to_uppercase();
        self.guard
            .run(async {
                let body = self.query("GLOBAL_QUOTE", &symbol).await?;
                let quote = match body.get("Global Quote") {
                    Some(q) if q.as_object().map_or(false, |o| !o.is_empty()) => q,
                    _ => return Ok(None),
                };
                let price = match quote.get("05. price").and_then(value_f64) {
                    Some(p) => p,
                    None => return Ok(None),
                };

                debug!(symbol, price, "alphavantage quote");
                Ok(Some(QuoteData {
                    symbol: symbol.clone(),
                    current_price: price,
                    previous_close: quote.get("08. previous close").and_then(value_f64),
                    open_price: quote.get("02. open").and_then(value_f64),
                    day_high: quote.get("03. high").and_then(value_f64),
                    day_low: quote.get("04. low").and_then(value_f64),
                    volume: quote.get("06. volume").and_then(value_i64),
                    market_cap: None,
                    timestamp: None,
                    source: self.name.clone(),
                }))
            })
            .await
    }

    async fn get_history(&self, symbol: &str, range: &HistoryRange) -> ProviderResult<HistorySeries> {
        let symbol = symbol.to_uppercase();
        let range = range.clone();
        self.guard
            .run(async {
                let body = self.query("TIME_SERIES_DAILY", &symbol).await?;
                let series = match body.get("Time Series (Daily)").and_then(|v| v.as_object()) {
                    Some(s) if !s.is_empty() => s,
                    _ => return Ok(None),
                };

                let mut bars: Vec<HistoryBar> = series
                    .iter()
                    .filter_map(|(date, row)| {
                        let day: NaiveDate = date.parse().ok()?;
                        Some(HistoryBar {
                            ts: day.and_hms_opt(0, 0, 0)?.and_utc(),
                            open: row.get("1. open").and_then(value_f64)?,
                            high: row.get("2. high").and_then(value_f64)?,
                            low: row.get("3. low").and_then(value_f64)?,
                            close: row.get("4. close").and_then(value_f64)?,
                            volume: row.get("5. volume").and_then(value_i64).unwrap_or(0),
                        })
                    })
                    .collect();
                bars.sort_by_key(|b| b.ts);

                if let Some(start) = range.start {
                    bars.retain(|b| b.ts.date_naive() >= start);
                }
                if let Some(end) = range.end {
                    bars.retain(|b| b.ts.date_naive() <= end);
                }

                if bars.is_empty() {
                    return Ok(None);
                }
                Ok(Some(HistorySeries {
                    symbol: symbol.clone(),
                    bars,
                    period: range.period.clone(),
                    start_date: range.start,
                    end_date: range.end,
                    source: self.name.clone(),
                }))
            })
            .await
    }

    async fn get_info(&self, symbol: &str) -> ProviderResult<CompanyInfo> {
        let symbol = symbol.to_uppercase();
        self.guard
            .run(async {
                let body = self.query("OVERVIEW", &symbol).await?;
                let name = match field_str(&body, "Name") {
                    Some(n) => n,
                    None => return Ok(None),
                };

                Ok(Some(CompanyInfo {
                    symbol: symbol.clone(),
                    name,
                    sector: field_str(&body, "Sector"),
                    industry: field_str(&body, "Industry"),
                    country: field_str(&body, "Country"),
                    description: field_str(&body, "Description"),
                    employees: None,
                    website: field_str(&body, "OfficialSite"),
                    currency: field_str(&body, "Currency"),
                    exchange: field_str(&body, "Exchange"),
                    source: self.name.clone(),
                }))
            })
            .await
    }

    async fn get_fundamentals(&self, symbol: &str) -> ProviderResult<FundamentalsData> {
        let symbol = symbol.to_uppercase();
        self.guard
            .run(async {
                let body = self.query("OVERVIEW", &symbol).await?;
                if field_str(&body, "Symbol").is_none() {
                    return Ok(None);
                }
                let num = |key: &str| body.get(key).and_then(value_f64);

                Ok(Some(FundamentalsData {
                    symbol: symbol.clone(),
                    pe_ratio: num("TrailingPE"),
                    forward_pe: num("ForwardPE"),
                    pb_ratio: num("PriceToBookRatio"),
                    ps_ratio: num("PriceToSalesRatioTTM"),
                    peg_ratio: num("PEGRatio"),
                    ev_ebitda: num("EVToEBITDA"),
                    profit_margin: num("ProfitMargin"),
                    operating_margin: num("OperatingMarginTTM"),
                    roe: num("ReturnOnEquityTTM"),
                    roa: num("ReturnOnAssetsTTM"),
                    revenue_growth: num("QuarterlyRevenueGrowthYOY"),
                    earnings_growth: num("QuarterlyEarningsGrowthYOY"),
                    beta: num("Beta"),
                    dividend_yield: num("DividendYield"),
                    eps_trailing: num("EPS"),
                    eps_forward: None,
                    target_high: None,
                    target_low: None,
                    target_mean: num("AnalystTargetPrice"),
                    recommendation: None,
                    source: self.name.clone(),
                }))
            })
            .await
    }

    fn health_check(&self) -> ProviderStatus {
        if self.api_key.is_none() {
            return ProviderStatus::Unavailable;
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_key_means_unavailable() {
        let settings = ProviderSettings::named("alphavantage");
        let adapter = AlphaVantageAdapter::new(&settings, None);
        assert_eq!(adapter.health_check(), ProviderStatus::Unavailable);
        assert!(!adapter.supports_symbol("AAPL"));
    }

    #[test]
    fn keyed_adapter_skips_index_tickers() {
        let settings = ProviderSettings::named("alphavantage");
        let adapter = AlphaVantageAdapter::new(&settings, Some("demo".into()));
        assert!(adapter.supports_symbol("AAPL"));
        assert!(!adapter.supports_symbol("^VIX"));
    }
}

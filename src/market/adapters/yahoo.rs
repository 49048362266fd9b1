//! Yahoo-style public market API adapter.
//!
//! Primary source for US and HK equities plus macro tickers. Covers every
//! data type but throttles aggressively under load (HTTP 429), so the
//! guard's cooldown handling matters most here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use super::{build_client, field_f64, field_i64, field_str, http_get_json, value_f64, value_i64};
use crate::config::ProviderSettings;
use crate::market::errors::ProviderError;
use crate::market::guard::{CircuitState, ProviderGuard};
use crate::market::provider::{guard_health, HistoryRange, MarketDataProvider, ProviderResult};
use crate::market::types::{
    CompanyInfo, DataType, EarningsData, EarningsRow, FundamentalsData, HistoryBar, HistorySeries,
    MarketKind, OptionLeg, OptionsChain, ProviderStatus, QuoteData,
};

const CHART_API_BASE: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const SUMMARY_API_BASE: &str = "https://query1.finance.yahoo.com/v10/finance/quoteSummary";
const OPTIONS_API_BASE: &str = "https://query2.finance.yahoo.com/v7/finance/options";

const SUPPORTED_DATA_TYPES: [DataType; 8] = [
    DataType::Quote,
    DataType::History,
    DataType::Info,
    DataType::Fundamentals,
    DataType::OptionsChain,
    DataType::OptionsExpirations,
    DataType::Earnings,
    DataType::Macro,
];
const SUPPORTED_MARKETS: [MarketKind; 2] = [MarketKind::Us, MarketKind::Hk];

pub struct YahooAdapter {
    name: String,
    client: reqwest::Client,
    guard: ProviderGuard,
}

impl YahooAdapter {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            name: settings.name.clone(),
            client: build_client(),
            guard: ProviderGuard::new(settings),
        }
    }

    async fn fetch_chart(&self, symbol: &str, range: &str) -> Result<Value, ProviderError> {
        let url = format!("{CHART_API_BASE}/{symbol}");
        let body = http_get_json(
            &self.client,
            &url,
            &[("range", range.to_string()), ("interval", "1d".to_string())],
        )
        .await?;

        // The chart envelope reports symbol errors in-band
        if let Some(err) = body.pointer("/chart/error").filter(|e| !e.is_null()) {
            let description = field_str(err, "description").unwrap_or_default();
            return Err(ProviderError::from_message(&format!(
                "no data found for {symbol}: {description}"
            )));
        }
        Ok(body)
    }

    fn chart_meta(body: &Value) -> Option<&Value> {
        body.pointer("/chart/result/0/meta")
    }

    fn parse_history(symbol: &str, body: &Value, range: &HistoryRange, source: &str) -> Option<HistorySeries> {
        let result = body.pointer("/chart/result/0")?;
        let timestamps = result.get("timestamp")?.as_array()?;
        let ohlcv = result.pointer("/indicators/quote/0")?;

        let series = |key: &str| -> Vec<Option<f64>> {
            ohlcv
                .get(key)
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().map(value_f64).collect())
                .unwrap_or_default()
        };
        let opens = series("open");
        let highs = series("high");
        let lows = series("low");
        let closes = series("close");
        let volumes: Vec<Option<i64>> = ohlcv
            .get("volume")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().map(value_i64).collect())
            .unwrap_or_default();

        let mut bars = Vec::with_capacity(timestamps.len());
        for (i, ts) in timestamps.iter().enumerate() {
            let ts = value_i64(ts)?;
            let at = |v: &Vec<Option<f64>>| v.get(i).copied().flatten();
            // Skip null rows (halted sessions)
            if let (Some(open), Some(high), Some(low), Some(close)) =
                (at(&opens), at(&highs), at(&lows), at(&closes))
            {
                bars.push(HistoryBar {
                    ts: DateTime::<Utc>::from_timestamp(ts, 0)?,
                    open,
                    high,
                    low,
                    close,
                    volume: volumes.get(i).copied().flatten().unwrap_or(0),
                });
            }
        }

        if bars.is_empty() {
            return None;
        }
        Some(HistorySeries {
            symbol: symbol.to_string(),
            bars,
            period: range.period.clone(),
            start_date: range.start,
            end_date: range.end,
            source: source.to_string(),
        })
    }

    async fn fetch_summary(&self, symbol: &str, modules: &str) -> Result<Value, ProviderError> {
        let url = format!("{SUMMARY_API_BASE}/{symbol}");
        let body = http_get_json(
            &self.client,
            &url,
            &[("modules", modules.to_string())],
        )
        .await?;

        if let Some(err) = body.pointer("/quoteSummary/error").filter(|e| !e.is_null()) {
            let description = field_str(err, "description").unwrap_or_default();
            return Err(ProviderError::from_message(&format!(
                "symbol not found {symbol}: {description}"
            )));
        }
        Ok(body)
    }

    /// Yahoo wraps numbers as {"raw": 1.23, "fmt": "1.23"}.
    fn raw_f64(v: &Value, key: &str) -> Option<f64> {
        v.get(key).and_then(|w| w.get("raw")).and_then(value_f64)
    }

    fn raw_i64(v: &Value, key: &str) -> Option<i64> {
        v.get(key).and_then(|w| w.get("raw")).and_then(value_i64)
    }

    fn parse_leg(leg: &Value) -> Option<OptionLeg> {
        Some(OptionLeg {
            strike: field_f64(leg, "strike")?,
            bid: field_f64(leg, "bid"),
            ask: field_f64(leg, "ask"),
            last_price: field_f64(leg, "lastPrice"),
            volume: field_i64(leg, "volume"),
            open_interest: field_i64(leg, "openInterest"),
            implied_volatility: field_f64(leg, "impliedVolatility"),
            delta: field_f64(leg, "delta"),
            gamma: field_f64(leg, "gamma"),
            theta: field_f64(leg, "theta"),
            vega: field_f64(leg, "vega"),
        })
    }
}

#[async_trait]
impl MarketDataProvider for YahooAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_data_types(&self) -> &[DataType] {
        &SUPPORTED_DATA_TYPES
    }

    fn supported_markets(&self) -> &[MarketKind] {
        &SUPPORTED_MARKETS
    }

    async fn get_quote(&self, symbol: &str) -> ProviderResult<QuoteData> {
        let symbol = symbol.to_string();
        self.guard
            .run(async {
                let body = self.fetch_chart(&symbol, "1d").await?;
                let meta = match Self::chart_meta(&body) {
                    Some(m) => m,
                    None => return Ok(None),
                };
                let price = match field_f64(meta, "regularMarketPrice") {
                    Some(p) => p,
                    None => return Ok(None),
                };

                debug!(symbol, price, "yahoo quote");
                Ok(Some(QuoteData {
                    symbol: symbol.clone(),
                    current_price: price,
                    previous_close: field_f64(meta, "chartPreviousClose")
                        .or_else(|| field_f64(meta, "previousClose")),
                    open_price: None,
                    day_high: field_f64(meta, "regularMarketDayHigh"),
                    day_low: field_f64(meta, "regularMarketDayLow"),
                    volume: field_i64(meta, "regularMarketVolume"),
                    market_cap: None,
                    timestamp: field_i64(meta, "regularMarketTime")
                        .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)),
                    source: self.name.clone(),
                }))
            })
            .await
    }

    async fn get_history(&self, symbol: &str, range: &HistoryRange) -> ProviderResult<HistorySeries> {
        let symbol = symbol.to_string();
        let range = range.clone();
        self.guard
            .run(async {
                let url = format!("{CHART_API_BASE}/{symbol}");
                let mut query = vec![("interval", "1d".to_string())];
                match (&range.start, &range.end) {
                    (Some(start), end) => {
                        let start_ts = start.and_hms_opt(0, 0, 0).map(|t| t.and_utc().timestamp());
                        let end_ts = end
                            .as_ref()
                            .and_then(|e| e.and_hms_opt(0, 0, 0))
                            .map(|t| t.and_utc().timestamp())
                            .unwrap_or_else(|| Utc::now().timestamp());
                        if let Some(start_ts) = start_ts {
                            query.push(("period1", start_ts.to_string()));
                            query.push(("period2", end_ts.to_string()));
                        }
                    }
                    _ => {
                        let named = range.period.clone().unwrap_or_else(|| "1mo".to_string());
                        query.push(("range", named));
                    }
                }

                let body = http_get_json(&self.client, &url, &query).await?;
                if let Some(err) = body.pointer("/chart/error").filter(|e| !e.is_null()) {
                    let description = field_str(err, "description").unwrap_or_default();
                    return Err(ProviderError::from_message(&format!(
                        "no data found for {symbol}: {description}"
                    )));
                }
                Ok(Self::parse_history(&symbol, &body, &range, &self.name))
            })
            .await
    }

    async fn get_info(&self, symbol: &str) -> ProviderResult<CompanyInfo> {
        let symbol = symbol.to_string();
        self.guard
            .run(async {
                let body = self.fetch_summary(&symbol, "assetProfile,price").await?;
                let result = match body.pointer("/quoteSummary/result/0") {
                    Some(r) => r,
                    None => return Ok(None),
                };
                let profile = result.get("assetProfile").cloned().unwrap_or(Value::Null);
                let price = result.get("price").cloned().unwrap_or(Value::Null);

                let name = field_str(&price, "longName")
                    .or_else(|| field_str(&price, "shortName"))
                    .unwrap_or_else(|| symbol.clone());

                Ok(Some(CompanyInfo {
                    symbol: symbol.clone(),
                    name,
                    sector: field_str(&profile, "sector"),
                    industry: field_str(&profile, "industry"),
                    country: field_str(&profile, "country"),
                    description: field_str(&profile, "longBusinessSummary"),
                    employees: field_i64(&profile, "fullTimeEmployees"),
                    website: field_str(&profile, "website"),
                    currency: field_str(&price, "currency"),
                    exchange: field_str(&price, "exchangeName"),
                    source: self.name.clone(),
                }))
            })
            .await
    }

    async fn get_fundamentals(&self, symbol: &str) -> ProviderResult<FundamentalsData> {
        let symbol = symbol.to_string();
        self.guard
            .run(async {
                let body = self
                    .fetch_summary(&symbol, "summaryDetail,financialData,defaultKeyStatistics")
                    .await?;
                let result = match body.pointer("/quoteSummary/result/0") {
                    Some(r) => r,
                    None => return Ok(None),
                };
                let detail = result.get("summaryDetail").cloned().unwrap_or(Value::Null);
                let financial = result.get("financialData").cloned().unwrap_or(Value::Null);
                let stats = result
                    .get("defaultKeyStatistics")
                    .cloned()
                    .unwrap_or(Value::Null);

                Ok(Some(FundamentalsData {
                    symbol: symbol.clone(),
                    pe_ratio: Self::raw_f64(&detail, "trailingPE"),
                    forward_pe: Self::raw_f64(&detail, "forwardPE"),
                    pb_ratio: Self::raw_f64(&stats, "priceToBook"),
                    ps_ratio: Self::raw_f64(&detail, "priceToSalesTrailing12Months"),
                    peg_ratio: Self::raw_f64(&stats, "pegRatio"),
                    ev_ebitda: Self::raw_f64(&stats, "enterpriseToEbitda"),
                    profit_margin: Self::raw_f64(&financial, "profitMargins"),
                    operating_margin: Self::raw_f64(&financial, "operatingMargins"),
                    roe: Self::raw_f64(&financial, "returnOnEquity"),
                    roa: Self::raw_f64(&financial, "returnOnAssets"),
                    revenue_growth: Self::raw_f64(&financial, "revenueGrowth"),
                    earnings_growth: Self::raw_f64(&financial, "earningsGrowth"),
                    beta: Self::raw_f64(&detail, "beta"),
                    dividend_yield: Self::raw_f64(&detail, "dividendYield"),
                    eps_trailing: Self::raw_f64(&stats, "trailingEps"),
                    eps_forward: Self::raw_f64(&stats, "forwardEps"),
                    target_high: Self::raw_f64(&financial, "targetHighPrice"),
                    target_low: Self::raw_f64(&financial, "targetLowPrice"),
                    target_mean: Self::raw_f64(&financial, "targetMeanPrice"),
                    recommendation: field_str(&financial, "recommendationKey"),
                    source: self.name.clone(),
                }))
            })
            .await
    }

    async fn get_options_expirations(&self, symbol: &str) -> ProviderResult<Vec<String>> {
        let symbol = symbol.to_string();
        self.guard
            .run(async {
                let url = format!("{OPTIONS_API_BASE}/{symbol}");
                let body = http_get_json(&self.client, &url, &[]).await?;
                let dates = body
                    .pointer("/optionChain/result/0/expirationDates")
                    .and_then(|v| v.as_array());
                let dates = match dates {
                    Some(d) if !d.is_empty() => d,
                    _ => return Ok(None),
                };
                let formatted: Vec<String> = dates
                    .iter()
                    .filter_map(value_i64)
                    .filter_map(|epoch| DateTime::<Utc>::from_timestamp(epoch, 0))
                    .map(|t| t.format("%Y-%m-%d").to_string())
                    .collect();
                Ok(Some(formatted))
            })
            .await
    }

    async fn get_options_chain(&self, symbol: &str, expiry: &str) -> ProviderResult<OptionsChain> {
        let symbol = symbol.to_string();
        let expiry = expiry.to_string();
        self.guard
            .run(async {
                let epoch = chrono::NaiveDate::parse_from_str(&expiry, "%Y-%m-%d")
                    .map_err(|_| {
                        ProviderError::Other(format!("bad expiry date format: {expiry}"))
                    })?
                    .and_hms_opt(0, 0, 0)
                    .map(|dt| dt.and_utc().timestamp())
                    .unwrap_or_default();

                let url = format!("{OPTIONS_API_BASE}/{symbol}");
                let body =
                    http_get_json(&self.client, &url, &[("date", epoch.to_string())]).await?;

                let result = match body.pointer("/optionChain/result/0") {
                    Some(r) => r,
                    None => return Ok(None),
                };
                let underlying_price = result
                    .pointer("/quote/regularMarketPrice")
                    .and_then(value_f64)
                    .unwrap_or(0.0);
                let options = match result.pointer("/options/0") {
                    Some(o) => o,
                    None => return Ok(None),
                };

                let parse_side = |key: &str| -> Vec<OptionLeg> {
                    options
                        .get(key)
                        .and_then(|v| v.as_array())
                        .map(|legs| legs.iter().filter_map(Self::parse_leg).collect())
                        .unwrap_or_default()
                };
                let chain = OptionsChain {
                    symbol: symbol.clone(),
                    expiry_date: expiry.clone(),
                    underlying_price,
                    calls: parse_side("calls"),
                    puts: parse_side("puts"),
                    source: self.name.clone(),
                };
                Ok(if chain.is_empty() { None } else { Some(chain) })
            })
            .await
    }

    async fn get_earnings(&self, symbol: &str) -> ProviderResult<EarningsData> {
        let symbol = symbol.to_string();
        self.guard
            .run(async {
                let body = self.fetch_summary(&symbol, "earnings").await?;
                let quarterly = body
                    .pointer("/quoteSummary/result/0/earnings/financialsChart/quarterly")
                    .and_then(|v| v.as_array());
                let quarterly = match quarterly {
                    Some(q) if !q.is_empty() => q,
                    _ => return Ok(None),
                };

                let rows: Vec<EarningsRow> = quarterly
                    .iter()
                    .filter_map(|row| {
                        Some(EarningsRow {
                            quarter: field_str(row, "date")?,
                            earnings: Self::raw_f64(row, "earnings"),
                            revenue: Self::raw_f64(row, "revenue"),
                        })
                    })
                    .collect();

                Ok(Some(EarningsData {
                    symbol: symbol.clone(),
                    quarterly: rows,
                    source: self.name.clone(),
                }))
            })
            .await
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_chart_history() {
        let body = json!({
            "chart": {
                "result": [{
                    "meta": {"regularMarketPrice": 195.0},
                    "timestamp": [1717200000i64, 1717286400i64],
                    "indicators": {"quote": [{
                        "open": [194.0, null],
                        "high": [196.0, 197.0],
                        "low": [193.0, 194.5],
                        "close": [195.0, 196.5],
                        "volume": [1000000, 1200000]
                    }]}
                }],
                "error": null
            }
        });
        let range = HistoryRange::period("5d");
        let series = YahooAdapter::parse_history("AAPL", &body, &range, "yahoo").unwrap();
        // The second row has a null open and is skipped
        assert_eq!(series.bars.len(), 1);
        assert_eq!(series.bars[0].close, 195.0);
        assert_eq!(series.source, "yahoo");
    }

    #[test]
    fn raw_wrapper_extraction() {
        let detail = json!({"trailingPE": {"raw": 31.2, "fmt": "31.20"}});
        assert_eq!(YahooAdapter::raw_f64(&detail, "trailingPE"), Some(31.2));
        assert_eq!(YahooAdapter::raw_f64(&detail, "missing"), None);
    }

    #[test]
    fn parses_option_leg_columns() {
        let leg = json!({
            "strike": 500.0, "bid": 12.0, "ask": 12.5, "lastPrice": 12.2,
            "volume": 350, "openInterest": 1200, "impliedVolatility": 0.42
        });
        let parsed = YahooAdapter::parse_leg(&leg).unwrap();
        assert_eq!(parsed.strike, 500.0);
        assert_eq!(parsed.open_interest, Some(1200));
        assert!(parsed.delta.is_none());
    }
}

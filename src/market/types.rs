//! Market-data types shared by adapters, router, cache and metrics.
//!
//! Every provider normalizes its source-specific payloads into these
//! shapes so the rest of the core never sees provider-specific columns.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Types of market data that can be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Quote,
    History,
    Info,
    Fundamentals,
    OptionsChain,
    OptionsExpirations,
    Earnings,
    Macro,
}

impl DataType {
    pub const ALL: [DataType; 8] = [
        DataType::Quote,
        DataType::History,
        DataType::Info,
        DataType::Fundamentals,
        DataType::OptionsChain,
        DataType::OptionsExpirations,
        DataType::Earnings,
        DataType::Macro,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Quote => "quote",
            DataType::History => "history",
            DataType::Info => "info",
            DataType::Fundamentals => "fundamentals",
            DataType::OptionsChain => "options_chain",
            DataType::OptionsExpirations => "options_expirations",
            DataType::Earnings => "earnings",
            DataType::Macro => "macro",
        }
    }
}

/// Supported markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketKind {
    Us,
    Hk,
    Cn,
    Commodity,
}

impl MarketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketKind::Us => "us",
            MarketKind::Hk => "hk",
            MarketKind::Cn => "cn",
            MarketKind::Commodity => "commodity",
        }
    }
}

/// Provider health status as self-reported by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Healthy,
    Degraded,
    RateLimited,
    Unavailable,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Healthy => "healthy",
            ProviderStatus::Degraded => "degraded",
            ProviderStatus::RateLimited => "rate_limited",
            ProviderStatus::Unavailable => "unavailable",
        }
    }
}

/// Real-time quote, normalized across providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteData {
    pub symbol: String,
    pub current_price: f64,
    pub previous_close: Option<f64>,
    pub open_price: Option<f64>,
    pub day_high: Option<f64>,
    pub day_low: Option<f64>,
    pub volume: Option<i64>,
    pub market_cap: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Which provider returned this
    pub source: String,
}

impl QuoteData {
    pub fn to_flat_json(&self) -> Value {
        json!({
            "symbol": self.symbol,
            "currentPrice": self.current_price,
            "regularMarketPrice": self.current_price,
            "previousClose": self.previous_close,
            "open": self.open_price,
            "dayHigh": self.day_high,
            "dayLow": self.day_low,
            "volume": self.volume,
            "marketCap": self.market_cap,
            "_source": self.source,
        })
    }
}

/// Fundamental metrics, normalized across providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FundamentalsData {
    pub symbol: String,
    pub pe_ratio: Option<f64>,
    pub forward_pe: Option<f64>,
    pub pb_ratio: Option<f64>,
    pub ps_ratio: Option<f64>,
    pub peg_ratio: Option<f64>,
    pub ev_ebitda: Option<f64>,
    pub profit_margin: Option<f64>,
    pub operating_margin: Option<f64>,
    pub roe: Option<f64>,
    pub roa: Option<f64>,
    pub revenue_growth: Option<f64>,
    pub earnings_growth: Option<f64>,
    pub beta: Option<f64>,
    pub dividend_yield: Option<f64>,
    pub eps_trailing: Option<f64>,
    pub eps_forward: Option<f64>,
    pub target_high: Option<f64>,
    pub target_low: Option<f64>,
    pub target_mean: Option<f64>,
    pub recommendation: Option<String>,
    pub source: String,
}

impl FundamentalsData {
    pub fn to_flat_json(&self) -> Value {
        json!({
            "trailingPE": self.pe_ratio,
            "forwardPE": self.forward_pe,
            "priceToBook": self.pb_ratio,
            "priceToSalesTrailing12Months": self.ps_ratio,
            "pegRatio": self.peg_ratio,
            "enterpriseToEbitda": self.ev_ebitda,
            "profitMargins": self.profit_margin,
            "operatingMargins": self.operating_margin,
            "returnOnEquity": self.roe,
            "returnOnAssets": self.roa,
            "revenueGrowth": self.revenue_growth,
            "earningsGrowth": self.earnings_growth,
            "beta": self.beta,
            "dividendYield": self.dividend_yield,
            "trailingEps": self.eps_trailing,
            "forwardEps": self.eps_forward,
            "targetHighPrice": self.target_high,
            "targetLowPrice": self.target_low,
            "targetMeanPrice": self.target_mean,
            "recommendationKey": self.recommendation,
            "_source": self.source,
        })
    }
}

/// Company info, normalized across providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyInfo {
    pub symbol: String,
    pub name: String,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub country: Option<String>,
    pub description: Option<String>,
    pub employees: Option<i64>,
    pub website: Option<String>,
    pub currency: Option<String>,
    pub exchange: Option<String>,
    pub source: String,
}

impl CompanyInfo {
    pub fn to_flat_json(&self) -> Value {
        json!({
            "symbol": self.symbol,
            "shortName": self.name,
            "longName": self.name,
            "sector": self.sector,
            "industry": self.industry,
            "country": self.country,
            "longBusinessSummary": self.description,
            "fullTimeEmployees": self.employees,
            "website": self.website,
            "currency": self.currency,
            "exchange": self.exchange,
            "_source": self.source,
        })
    }
}

/// One OHLCV bar. Timestamps are tz-aware UTC instants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryBar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// Historical OHLCV series with request metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySeries {
    pub symbol: String,
    pub bars: Vec<HistoryBar>,
    pub period: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub source: String,
}

impl HistorySeries {
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.bars.last().map(|b| b.close)
    }
}

/// One option leg (a single strike row of a chain side).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionLeg {
    pub strike: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last_price: Option<f64>,
    pub volume: Option<i64>,
    pub open_interest: Option<i64>,
    pub implied_volatility: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
}

/// Options chain for one (symbol, expiry), normalized across providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionsChain {
    pub symbol: String,
    pub expiry_date: String,
    pub underlying_price: f64,
    pub calls: Vec<OptionLeg>,
    pub puts: Vec<OptionLeg>,
    pub source: String,
}

impl OptionsChain {
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty() && self.puts.is_empty()
    }
}

/// One quarterly earnings row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningsRow {
    pub quarter: String,
    pub earnings: Option<f64>,
    pub revenue: Option<f64>,
}

/// Quarterly earnings series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningsData {
    pub symbol: String,
    pub quarterly: Vec<EarningsRow>,
    pub source: String,
}

impl EarningsData {
    pub fn is_empty(&self) -> bool {
        self.quarterly.is_empty()
    }
}

/// Any value the market-data cache (and deduplicator) can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CachedValue {
    Quote(QuoteData),
    History(HistorySeries),
    Info(CompanyInfo),
    Fundamentals(FundamentalsData),
    OptionsChain(OptionsChain),
    Expirations(Vec<String>),
    Earnings(EarningsData),
}

impl CachedValue {
    pub fn as_quote(self) -> Option<QuoteData> {
        match self {
            CachedValue::Quote(q) => Some(q),
            _ => None,
        }
    }
    pub fn as_history(self) -> Option<HistorySeries> {
        match self {
            CachedValue::History(h) => Some(h),
            _ => None,
        }
    }
    pub fn as_info(self) -> Option<CompanyInfo> {
        match self {
            CachedValue::Info(i) => Some(i),
            _ => None,
        }
    }
    pub fn as_fundamentals(self) -> Option<FundamentalsData> {
        match self {
            CachedValue::Fundamentals(f) => Some(f),
            _ => None,
        }
    }
    pub fn as_options_chain(self) -> Option<OptionsChain> {
        match self {
            CachedValue::OptionsChain(c) => Some(c),
            _ => None,
        }
    }
    pub fn as_expirations(self) -> Option<Vec<String>> {
        match self {
            CachedValue::Expirations(e) => Some(e),
            _ => None,
        }
    }
    pub fn as_earnings(self) -> Option<EarningsData> {
        match self {
            CachedValue::Earnings(e) => Some(e),
            _ => None,
        }
    }
}

/// Merge several flat JSON maps into one, later maps winning on key
/// collisions. Used by the composed ticker-data lookup.
pub fn merge_flat_json(maps: &[Value]) -> Value {
    let mut out = Map::new();
    for m in maps {
        if let Value::Object(obj) = m {
            for (k, v) in obj {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_flat_json_keeps_source() {
        let quote = QuoteData {
            symbol: "AAPL".into(),
            current_price: 195.0,
            previous_close: Some(193.2),
            open_price: None,
            day_high: None,
            day_low: None,
            volume: Some(1_000_000),
            market_cap: None,
            timestamp: None,
            source: "yahoo".into(),
        };
        let v = quote.to_flat_json();
        assert_eq!(v["currentPrice"], 195.0);
        assert_eq!(v["_source"], "yahoo");
    }

    #[test]
    fn cached_value_downcasts() {
        let chain = OptionsChain {
            symbol: "NVDA".into(),
            expiry_date: "2026-09-18".into(),
            underlying_price: 500.0,
            calls: vec![],
            puts: vec![],
            source: "tiger".into(),
        };
        let v = CachedValue::OptionsChain(chain.clone());
        assert_eq!(v.clone().as_options_chain(), Some(chain));
        assert!(v.as_quote().is_none());
    }

    #[test]
    fn merge_later_maps_win() {
        let merged = merge_flat_json(&[
            serde_json::json!({"a": 1, "b": 1}),
            serde_json::json!({"b": 2}),
        ]);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }
}

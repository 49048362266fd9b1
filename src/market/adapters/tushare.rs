//! A-share data API adapter.
//!
//! Primary source for CN A-share quotes, history, company info and
//! fundamentals. The API is a single POST endpoint taking an api_name
//! plus a token; permissions are tiered per api_name, so a denied call is
//! classified rather than retried. Without a token the adapter is
//! permanently unavailable.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::{build_client, value_f64, value_i64};
use crate::config::ProviderSettings;
use crate::market::detector::detect_market_with_exchange;
use crate::market::errors::ProviderError;
use crate::market::guard::{CircuitState, ProviderGuard};
use crate::market::provider::{guard_health, HistoryRange, MarketDataProvider, ProviderResult};
use crate::market::types::{
    CompanyInfo, DataType, FundamentalsData, HistoryBar, HistorySeries, MarketKind,
    ProviderStatus, QuoteData,
};

const API_BASE: &str = "https://api.tushare.pro";

const SUPPORTED_DATA_TYPES: [DataType; 4] = [
    DataType::Quote,
    DataType::History,
    DataType::Info,
    DataType::Fundamentals,
];
const SUPPORTED_MARKETS: [MarketKind; 1] = [MarketKind::Cn];

pub struct TushareAdapter {
    name: String,
    client: reqwest::Client,
    token: Option<String>,
    guard: ProviderGuard,
}

impl TushareAdapter {
    pub fn new(settings: &ProviderSettings, token: Option<String>) -> Self {
        if token.is_none() {
            warn!("tushare token not configured, adapter unavailable");
        }
        Self {
            name: settings.name.clone(),
            client: build_client(),
            token,
            guard: ProviderGuard::new(settings),
        }
    }

    /// Convert a normalized symbol to the API's ts_code form: Shanghai
    /// uses `.SH`, Shenzhen `.SZ`.
    fn to_ts_code(symbol: &str) -> Option<String> {
        let upper = symbol.trim().to_uppercase();
        if let Some(base) = upper.strip_suffix(".SS").or_else(|| upper.strip_suffix(".SH")) {
            return Some(format!("{base}.SH"));
        }
        if upper.ends_with(".SZ") {
            return Some(upper);
        }
        let (_, exchange) = detect_market_with_exchange(&upper);
        match exchange {
            Some("SS") => Some(format!("{upper}.SH")),
            Some("SZ") => Some(format!("{upper}.SZ")),
            _ => None,
        }
    }

    async fn call(&self, api_name: &str, params: Value, fields: &str) -> Result<Value, ProviderError> {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| ProviderError::Other("api token not configured".into()))?;

        let body = json!({
            "api_name": api_name,
            "token": token,
            "params": params,
            "fields": fields,
        });

        let response = self
            .client
            .post(API_BASE)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &text));
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::from_transport(&e))?;

        let code = envelope.get("code").and_then(value_i64).unwrap_or(-1);
        if code != 0 {
            let msg = envelope
                .get("msg")
                .and_then(|m| m.as_str())
                .unwrap_or("api error");
            return Err(ProviderError::from_message(msg));
        }
        Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
    }

    /// Zip one item row against the response's field list.
    fn row_map(fields: &[Value], item: &Value) -> Map<String, Value> {
        let mut out = Map::new();
        if let Some(cells) = item.as_array() {
            for (field, cell) in fields.iter().zip(cells) {
                if let Some(name) = field.as_str() {
                    out.insert(name.to_string(), cell.clone());
                }
            }
        }
        out
    }

    fn rows(data: &Value) -> Vec<Map<String, Value>> {
        let fields = data
            .get("fields")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        data.get("items")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().map(|item| Self::row_map(&fields, item)).collect())
            .unwrap_or_default()
    }

    fn parse_trade_date(row: &Map<String, Value>) -> Option<NaiveDate> {
        let raw = row.get("trade_date")?.as_str()?;
        NaiveDate::parse_from_str(raw, "%Y%m%d").ok()
    }
}

#[async_trait]
impl MarketDataProvider for TushareAdapter {
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
        self.token.is_some() && Self::to_ts_code(symbol).is_some()
    }

    async fn get_quote(&self, symbol: &str) -> ProviderResult<QuoteData> {
        let symbol = symbol.to_uppercase();
        self.guard
            .run(async {
                let ts_code = match Self::to_ts_code(&symbol) {
                    Some(c) => c,
                    None => return Ok(None),
                };
                let data = self
                    .call(
                        "daily",
                        json!({"ts_code": ts_code}),
                        "ts_code,trade_date,open,high,low,close,pre_close,vol",
                    )
                    .await?;

                // Rows arrive newest first
                let rows = Self::rows(&data);
                let latest = match rows.first() {
                    Some(r) => r,
                    None => return Ok(None),
                };
                let close = match latest.get("close").and_then(value_f64) {
                    Some(c) => c,
                    None => return Ok(None),
                };

                debug!(symbol, close, "tushare quote");
                Ok(Some(QuoteData {
                    symbol: symbol.clone(),
                    current_price: close,
                    previous_close: latest.get("pre_close").and_then(value_f64),
                    open_price: latest.get("open").and_then(value_f64),
                    day_high: latest.get("high").and_then(value_f64),
                    day_low: latest.get("low").and_then(value_f64),
                    // Volume arrives in lots of 100 shares
                    volume: latest
                        .get("vol")
                        .and_then(value_f64)
                        .map(|v| (v * 100.0) as i64),
                    market_cap: None,
                    timestamp: Self::parse_trade_date(latest)
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                        .map(|t| t.and_utc()),
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
                let ts_code = match Self::to_ts_code(&symbol) {
                    Some(c) => c,
                    None => return Ok(None),
                };
                let mut params = json!({"ts_code": ts_code});
                if let Some(start) = range.start {
                    params["start_date"] = json!(start.format("%Y%m%d").to_string());
                }
                if let Some(end) = range.end {
                    params["end_date"] = json!(end.format("%Y%m%d").to_string());
                }

                let data = self
                    .call(
                        "daily",
                        params,
                        "ts_code,trade_date,open,high,low,close,vol",
                    )
                    .await?;

                let mut bars: Vec<HistoryBar> = Self::rows(&data)
                    .iter()
                    .filter_map(|row| {
                        Some(HistoryBar {
                            ts: Self::parse_trade_date(row)?.and_hms_opt(0, 0, 0)?.and_utc(),
                            open: row.get("open").and_then(value_f64)?,
                            high: row.get("high").and_then(value_f64)?,
                            low: row.get("low").and_then(value_f64)?,
                            close: row.get("close").and_then(value_f64)?,
                            volume: row
                                .get("vol")
                                .and_then(value_f64)
                                .map(|v| (v * 100.0) as i64)
                                .unwrap_or(0),
                        })
                    })
                    .collect();
                bars.sort_by_key(|b| b.ts);

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
                let ts_code = match Self::to_ts_code(&symbol) {
                    Some(c) => c,
                    None => return Ok(None),
                };
                let data = self
                    .call(
                        "stock_basic",
                        json!({"ts_code": ts_code}),
                        "ts_code,name,industry,area,market,exchange,list_date",
                    )
                    .await?;

                let rows = Self::rows(&data);
                let row = match rows.first() {
                    Some(r) => r,
                    None => return Ok(None),
                };
                let name = match row.get("name").and_then(|v| v.as_str()) {
                    Some(n) => n.to_string(),
                    None => return Ok(None),
                };

                Ok(Some(CompanyInfo {
                    symbol: symbol.clone(),
                    name,
                    sector: row.get("industry").and_then(|v| v.as_str()).map(String::from),
                    industry: row.get("industry").and_then(|v| v.as_str()).map(String::from),
                    country: Some("China".to_string()),
                    description: None,
                    employees: None,
                    website: None,
                    currency: Some("CNY".to_string()),
                    exchange: row.get("exchange").and_then(|v| v.as_str()).map(String::from),
                    source: self.name.clone(),
                }))
            })
            .await
    }

    async fn get_fundamentals(&self, symbol: &str) -> ProviderResult<FundamentalsData> {
        let symbol = symbol.to_uppercase();
        self.guard
            .run(async {
                let ts_code = match Self::to_ts_code(&symbol) {
                    Some(c) => c,
                    None => return Ok(None),
                };
                let data = self
                    .call(
                        "daily_basic",
                        json!({"ts_code": ts_code}),
                        "ts_code,trade_date,pe,pe_ttm,pb,ps,ps_ttm,dv_ratio,total_mv",
                    )
                    .await?;

                let rows = Self::rows(&data);
                let row = match rows.first() {
                    Some(r) => r,
                    None => return Ok(None),
                };

                Ok(Some(FundamentalsData {
                    symbol: symbol.clone(),
                    pe_ratio: row.get("pe_ttm").and_then(value_f64).or_else(|| row.get("pe").and_then(value_f64)),
                    pb_ratio: row.get("pb").and_then(value_f64),
                    ps_ratio: row.get("ps_ttm").and_then(value_f64).or_else(|| row.get("ps").and_then(value_f64)),
                    dividend_yield: row
                        .get("dv_ratio")
                        .and_then(value_f64)
                        .map(|pct| pct / 100.0),
                    source: self.name.clone(),
                    ..Default::default()
                }))
            })
            .await
    }

    fn health_check(&self) -> ProviderStatus {
        if self.token.is_none() {
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
    fn ts_code_conversion() {
        assert_eq!(TushareAdapter::to_ts_code("600519.SS").as_deref(), Some("600519.SH"));
        assert_eq!(TushareAdapter::to_ts_code("600519.SH").as_deref(), Some("600519.SH"));
        assert_eq!(TushareAdapter::to_ts_code("000001.SZ").as_deref(), Some("000001.SZ"));
        assert_eq!(TushareAdapter::to_ts_code("600519").as_deref(), Some("600519.SH"));
        assert_eq!(TushareAdapter::to_ts_code("300750").as_deref(), Some("300750.SZ"));
        assert_eq!(TushareAdapter::to_ts_code("AAPL"), None);
    }

    #[test]
    fn rows_zip_fields_and_items() {
        let data = json!({
            "fields": ["ts_code", "close", "trade_date"],
            "items": [["600519.SH", 1700.5, "20240601"], ["600519.SH", 1690.0, "20240531"]]
        });
        let rows = TushareAdapter::rows(&data);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("close").and_then(value_f64), Some(1700.5));
        assert_eq!(
            TushareAdapter::parse_trade_date(&rows[0]),
            NaiveDate::from_ymd_opt(2024, 6, 1)
        );
    }

    #[test]
    fn no_token_means_unavailable() {
        let settings = ProviderSettings::named("tushare");
        let adapter = TushareAdapter::new(&settings, None);
        assert_eq!(adapter.health_check(), ProviderStatus::Unavailable);
        assert!(!adapter.supports_symbol("600519"));
    }
}

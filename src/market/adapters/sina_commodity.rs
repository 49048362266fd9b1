//! Commodity futures adapter (Sina-backed).
//!
//! The only source for domestic commodity futures quotes and options
//! (au/ag/cu/al/m). Quotes come from the delayed hq feed (~15s behind);
//! chains and contract months from the openapi surface.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::Value;
use tracing::debug;

use super::{build_client, field_f64, field_i64, field_str, http_get_json, http_get_text, value_f64};
use crate::config::ProviderSettings;
use crate::market::detector::is_commodity_symbol;
use crate::market::guard::{CircuitState, ProviderGuard};
use crate::market::provider::{guard_health, HistoryRange, MarketDataProvider, ProviderResult};
use crate::market::types::{
    CompanyInfo, DataType, FundamentalsData, HistoryBar, HistorySeries, MarketKind, OptionLeg,
    OptionsChain, ProviderStatus, QuoteData,
};

const HQ_BASE: &str = "https://hq.sinajs.cn/list=";
const KLINE_BASE: &str =
    "https://stock2.finance.sina.com.cn/futures/api/json.php/InnerFuturesNewService.getDailyKLine";
const OPTION_BASE: &str =
    "https://stock.finance.sina.com.cn/futures/api/openapi.php/CommodityOptionService";

const SUPPORTED_DATA_TYPES: [DataType; 4] = [
    DataType::Quote,
    DataType::History,
    DataType::OptionsChain,
    DataType::OptionsExpirations,
];
const SUPPORTED_MARKETS: [MarketKind; 1] = [MarketKind::Commodity];

pub struct SinaCommodityAdapter {
    name: String,
    client: reqwest::Client,
    guard: ProviderGuard,
}

impl SinaCommodityAdapter {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            name: settings.name.clone(),
            client: build_client(),
            guard: ProviderGuard::new(settings),
        }
    }

    /// Strip an exchange prefix: `SHFE.au2604` -> `au2604`.
    fn contract_code(symbol: &str) -> String {
        let s = symbol.trim();
        match s.split_once('.') {
            Some((_, rest)) => rest.to_uppercase(),
            None => s.to_uppercase(),
        }
    }

    /// Alphabetic product code: `AU2604` -> `au`.
    fn product_code(symbol: &str) -> String {
        Self::contract_code(symbol)
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_lowercase()
    }

    /// Parse one hq feed line:
    /// `var hq_str_nf_AU2604="黄金2604,145959,552.0,...";`
    ///
    /// Field layout: 0 name, 1 time, 2 open, 3 high, 4 low, 5 prev close,
    /// 6 bid, 7 ask, 8 last, 9 settle, 10 prev settle, 13 open interest,
    /// 14 volume.
    fn parse_hq_line(line: &str) -> Option<Vec<String>> {
        let start = line.find('"')? + 1;
        let end = line.rfind('"')?;
        if start >= end {
            return None;
        }
        Some(line[start..end].split(',').map(|s| s.to_string()).collect())
    }

    fn hq_f64(fields: &[String], idx: usize) -> Option<f64> {
        fields.get(idx).and_then(|s| s.trim().parse().ok())
    }

    fn hq_i64(fields: &[String], idx: usize) -> Option<i64> {
        fields
            .get(idx)
            .and_then(|s| s.trim().parse::<f64>().ok())
            .map(|v| v as i64)
    }

    fn parse_leg(leg: &Value) -> Option<OptionLeg> {
        Some(OptionLeg {
            strike: field_f64(leg, "strike")?,
            bid: field_f64(leg, "bid"),
            ask: field_f64(leg, "ask"),
            last_price: field_f64(leg, "last"),
            volume: field_i64(leg, "volume"),
            open_interest: field_i64(leg, "position"),
            implied_volatility: field_f64(leg, "iv"),
            delta: field_f64(leg, "delta"),
            gamma: field_f64(leg, "gamma"),
            theta: field_f64(leg, "theta"),
            vega: field_f64(leg, "vega"),
        })
    }
}

#[async_trait]
impl MarketDataProvider for SinaCommodityAdapter {
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
        is_commodity_symbol(symbol)
    }

    async fn get_quote(&self, symbol: &str) -> ProviderResult<QuoteData> {
        let contract = Self::contract_code(symbol);
        self.guard
            .run(async {
                let url = format!("{HQ_BASE}nf_{contract}");
                let text = http_get_text(&self.client, &url, &[]).await?;

                let fields = match Self::parse_hq_line(&text) {
                    Some(f) if f.len() >= 15 => f,
                    _ => return Ok(None),
                };
                let last = match Self::hq_f64(&fields, 8) {
                    Some(p) if p > 0.0 => p,
                    _ => return Ok(None),
                };

                debug!(contract, last, "commodity quote");
                Ok(Some(QuoteData {
                    symbol: contract.clone(),
                    current_price: last,
                    previous_close: Self::hq_f64(&fields, 10).or_else(|| Self::hq_f64(&fields, 5)),
                    open_price: Self::hq_f64(&fields, 2),
                    day_high: Self::hq_f64(&fields, 3),
                    day_low: Self::hq_f64(&fields, 4),
                    volume: Self::hq_i64(&fields, 14),
                    market_cap: None,
                    timestamp: Some(Utc::now()),
                    source: self.name.clone(),
                }))
            })
            .await
    }

    async fn get_history(&self, symbol: &str, range: &HistoryRange) -> ProviderResult<HistorySeries> {
        let contract = Self::contract_code(symbol);
        let range = range.clone();
        self.guard
            .run(async {
                let body =
                    http_get_json(&self.client, KLINE_BASE, &[("symbol", contract.clone())])
                        .await?;
                let rows = match body.as_array() {
                    Some(rows) if !rows.is_empty() => rows,
                    _ => return Ok(None),
                };

                let mut bars: Vec<HistoryBar> = rows
                    .iter()
                    .filter_map(|row| {
                        let day: NaiveDate = field_str(row, "d")?.parse().ok()?;
                        Some(HistoryBar {
                            ts: day.and_hms_opt(0, 0, 0)?.and_utc(),
                            open: row.get("o").and_then(value_f64)?,
                            high: row.get("h").and_then(value_f64)?,
                            low: row.get("l").and_then(value_f64)?,
                            close: row.get("c").and_then(value_f64)?,
                            volume: row
                                .get("v")
                                .and_then(value_f64)
                                .map(|v| v as i64)
                                .unwrap_or(0),
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
                    symbol: contract.clone(),
                    bars,
                    period: range.period.clone(),
                    start_date: range.start,
                    end_date: range.end,
                    source: self.name.clone(),
                }))
            })
            .await
    }

    async fn get_info(&self, _symbol: &str) -> ProviderResult<CompanyInfo> {
        // Futures contracts have no company profile
        Ok(None)
    }

    async fn get_fundamentals(&self, _symbol: &str) -> ProviderResult<FundamentalsData> {
        Ok(None)
    }

    async fn get_options_expirations(&self, symbol: &str) -> ProviderResult<Vec<String>> {
        let product = Self::product_code(symbol);
        self.guard
            .run(async {
                let url = format!("{OPTION_BASE}.getContractMonths");
                let body =
                    http_get_json(&self.client, &url, &[("product", product.clone())]).await?;
                let months = body
                    .pointer("/result/data")
                    .and_then(|v| v.as_array());
                let months = match months {
                    Some(m) if !m.is_empty() => m,
                    _ => return Ok(None),
                };
                let contracts: Vec<String> = months
                    .iter()
                    .filter_map(|m| m.as_str())
                    .map(|s| s.to_string())
                    .collect();
                Ok(Some(contracts))
            })
            .await
    }

    async fn get_options_chain(&self, symbol: &str, expiry: &str) -> ProviderResult<OptionsChain> {
        let contract = Self::contract_code(symbol);
        let expiry = expiry.to_string();
        self.guard
            .run(async {
                let url = format!("{OPTION_BASE}.getOptionChain");
                let body = http_get_json(
                    &self.client,
                    &url,
                    &[("contract", contract.clone()), ("expiry", expiry.clone())],
                )
                .await?;

                let data = match body.pointer("/result/data") {
                    Some(d) => d,
                    None => return Ok(None),
                };
                let underlying_price = field_f64(data, "underlying_price").unwrap_or(0.0);
                let parse_side = |key: &str| -> Vec<OptionLeg> {
                    data.get(key)
                        .and_then(|v| v.as_array())
                        .map(|legs| legs.iter().filter_map(Self::parse_leg).collect())
                        .unwrap_or_default()
                };

                // The feed labels calls "up" and puts "down"
                let chain = OptionsChain {
                    symbol: contract.clone(),
                    expiry_date: expiry.clone(),
                    underlying_price,
                    calls: parse_side("up"),
                    puts: parse_side("down"),
                    source: self.name.clone(),
                };
                Ok(if chain.is_empty() { None } else { Some(chain) })
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

    #[test]
    fn contract_and_product_codes() {
        assert_eq!(SinaCommodityAdapter::contract_code("SHFE.au2604"), "AU2604");
        assert_eq!(SinaCommodityAdapter::contract_code("au2604"), "AU2604");
        assert_eq!(SinaCommodityAdapter::product_code("SHFE.au2604"), "au");
        assert_eq!(SinaCommodityAdapter::product_code("m2605"), "m");
    }

    #[test]
    fn parses_hq_feed_line() {
        let line = r#"var hq_str_nf_AU2604="黄金2604,145959,552.0,555.5,550.2,551.0,552.8,553.0,553.4,553.0,551.5,10,12,180524,95210,上海期货交易所";"#;
        let fields = SinaCommodityAdapter::parse_hq_line(line).unwrap();
        assert!(fields.len() >= 15);
        assert_eq!(SinaCommodityAdapter::hq_f64(&fields, 8), Some(553.4));
        assert_eq!(SinaCommodityAdapter::hq_i64(&fields, 14), Some(95210));
    }

    #[test]
    fn malformed_hq_line_is_none() {
        assert!(SinaCommodityAdapter::parse_hq_line("garbage").is_none());
        assert!(SinaCommodityAdapter::parse_hq_line(r#"var x="";"#).is_none());
    }

    #[test]
    fn only_commodity_symbols_supported() {
        let adapter = SinaCommodityAdapter::new(&ProviderSettings::named("sina_commodity"));
        assert!(adapter.supports_symbol("au2604"));
        assert!(adapter.supports_symbol("SHFE.au2604"));
        assert!(!adapter.supports_symbol("AAPL"));
    }
}

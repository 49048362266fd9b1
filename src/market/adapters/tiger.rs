//! Broker gateway adapter.
//!
//! Real-time quotes, klines and options chains for US, HK and CN markets
//! via an authenticated broker gateway. Requests are HMAC-SHA256 signed
//! with the account secret. Without configured credentials the adapter is
//! permanently unavailable and the router excludes it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use super::{build_client, field_f64, field_i64, value_f64, value_i64};
use crate::config::{Credentials, ProviderSettings};
use crate::market::errors::ProviderError;
use crate::market::guard::{CircuitState, ProviderGuard};
use crate::market::provider::{guard_health, HistoryRange, MarketDataProvider, ProviderResult};
use crate::market::types::{
    CompanyInfo, DataType, FundamentalsData, HistoryBar, HistorySeries, MarketKind, OptionLeg,
    OptionsChain, ProviderStatus, QuoteData,
};

const GATEWAY_BASE: &str = "https://openapi.tigerfintech.com/gateway";

const SUPPORTED_DATA_TYPES: [DataType; 4] = [
    DataType::Quote,
    DataType::History,
    DataType::OptionsChain,
    DataType::OptionsExpirations,
];
const SUPPORTED_MARKETS: [MarketKind; 3] = [MarketKind::Us, MarketKind::Hk, MarketKind::Cn];

type HmacSha256 = Hmac<Sha256>;

struct BrokerCredentials {
    tiger_id: String,
    account: String,
    secret: String,
}

pub struct TigerAdapter {
    name: String,
    client: reqwest::Client,
    credentials: Option<BrokerCredentials>,
    guard: ProviderGuard,
}

impl TigerAdapter {
    pub fn new(settings: &ProviderSettings, credentials: &Credentials) -> Self {
        let broker = match (
            &credentials.tiger_id,
            &credentials.tiger_account,
            &credentials.tiger_secret,
        ) {
            (Some(id), Some(account), Some(secret)) => Some(BrokerCredentials {
                tiger_id: id.clone(),
                account: account.clone(),
                secret: secret.clone(),
            }),
            _ => {
                warn!("broker credentials not configured, adapter unavailable");
                None
            }
        };
        Self {
            name: settings.name.clone(),
            client: build_client(),
            credentials: broker,
            guard: ProviderGuard::new(settings),
        }
    }

    fn sign(secret: &str, payload: &str) -> String {
        // HMAC accepts keys of any length, so this cannot fail in practice
        match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mut mac) => {
                mac.update(payload.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            Err(_) => String::new(),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        let broker = self
            .credentials
            .as_ref()
            .ok_or_else(|| ProviderError::Other("broker credentials not configured".into()))?;

        let timestamp = Utc::now().timestamp_millis();
        let canonical = format!(
            "{}|{}|{}|{}",
            broker.tiger_id,
            method,
            timestamp,
            serde_json::to_string(&params).unwrap_or_default()
        );
        let body = json!({
            "method": method,
            "params": params,
            "tiger_id": broker.tiger_id,
            "account": broker.account,
            "timestamp": timestamp,
            "sign": Self::sign(&broker.secret, &canonical),
        });

        let response = self
            .client
            .post(format!("{GATEWAY_BASE}/api"))
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
            let message = envelope
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("gateway error");
            return Err(ProviderError::from_message(message));
        }
        Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
    }

    fn parse_leg(leg: &Value) -> Option<OptionLeg> {
        Some(OptionLeg {
            strike: field_f64(leg, "strike")?,
            bid: field_f64(leg, "bid"),
            ask: field_f64(leg, "ask"),
            last_price: field_f64(leg, "latest_price").or_else(|| field_f64(leg, "lastPrice")),
            volume: field_i64(leg, "volume"),
            open_interest: field_i64(leg, "open_interest"),
            implied_volatility: field_f64(leg, "implied_vol"),
            delta: field_f64(leg, "delta"),
            gamma: field_f64(leg, "gamma"),
            theta: field_f64(leg, "theta"),
            vega: field_f64(leg, "vega"),
        })
    }
}

#[async_trait]
impl MarketDataProvider for TigerAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_data_types(&self) -> &[DataType] {
        &SUPPORTED_DATA_TYPES
    }

    fn supported_markets(&self) -> &[MarketKind] {
        &SUPPORTED_MARKETS
    }

    fn supports_symbol(&self, _symbol: &str) -> bool {
        self.credentials.is_some()
    }

    async fn get_quote(&self, symbol: &str) -> ProviderResult<QuoteData> {
        let symbol = symbol.to_uppercase();
        self.guard
            .run(async {
                let data = self
                    .call("quote/real_time", json!({"symbols": [symbol]}))
                    .await?;
                let item = match data.pointer("/items/0") {
                    Some(item) => item,
                    None => return Ok(None),
                };
                let price = match field_f64(item, "latest_price") {
                    Some(p) => p,
                    None => return Ok(None),
                };

                debug!(symbol, price, "broker quote");
                Ok(Some(QuoteData {
                    symbol: symbol.clone(),
                    current_price: price,
                    previous_close: field_f64(item, "prev_close"),
                    open_price: field_f64(item, "open"),
                    day_high: field_f64(item, "high"),
                    day_low: field_f64(item, "low"),
                    volume: field_i64(item, "volume"),
                    market_cap: field_f64(item, "market_cap"),
                    timestamp: field_i64(item, "latest_time")
                        .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms)),
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
                let mut params = json!({
                    "symbols": [symbol],
                    "period": "day",
                });
                if let Some(period) = &range.period {
                    params["range"] = json!(period);
                }
                if let Some(start) = range.start {
                    params["begin_time"] = json!(start.to_string());
                }
                if let Some(end) = range.end {
                    params["end_time"] = json!(end.to_string());
                }

                let data = self.call("kline", params).await?;
                let items = match data.pointer("/items/0/items").and_then(|v| v.as_array()) {
                    Some(items) if !items.is_empty() => items,
                    _ => return Ok(None),
                };

                let bars: Vec<HistoryBar> = items
                    .iter()
                    .filter_map(|bar| {
                        Some(HistoryBar {
                            ts: DateTime::<Utc>::from_timestamp_millis(field_i64(bar, "time")?)?,
                            open: field_f64(bar, "open")?,
                            high: field_f64(bar, "high")?,
                            low: field_f64(bar, "low")?,
                            close: field_f64(bar, "close")?,
                            volume: field_i64(bar, "volume").unwrap_or(0),
                        })
                    })
                    .collect();

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

    async fn get_info(&self, _symbol: &str) -> ProviderResult<CompanyInfo> {
        // The gateway has no company-profile endpoint
        Ok(None)
    }

    async fn get_fundamentals(&self, _symbol: &str) -> ProviderResult<FundamentalsData> {
        Ok(None)
    }

    async fn get_options_expirations(&self, symbol: &str) -> ProviderResult<Vec<String>> {
        let symbol = symbol.to_uppercase();
        self.guard
            .run(async {
                let data = self
                    .call("option/expirations", json!({"symbols": [symbol]}))
                    .await?;
                let dates = match data.pointer("/items/0/dates").and_then(|v| v.as_array()) {
                    Some(d) if !d.is_empty() => d,
                    _ => return Ok(None),
                };
                let formatted: Vec<String> = dates
                    .iter()
                    .filter_map(|d| match d {
                        Value::String(s) => Some(s.clone()),
                        other => value_i64(other)
                            .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms))
                            .map(|t| t.format("%Y-%m-%d").to_string()),
                    })
                    .collect();
                Ok(Some(formatted))
            })
            .await
    }

    async fn get_options_chain(&self, symbol: &str, expiry: &str) -> ProviderResult<OptionsChain> {
        let symbol = symbol.to_uppercase();
        let expiry = expiry.to_string();
        self.guard
            .run(async {
                let data = self
                    .call(
                        "option/chain",
                        json!({"symbol": symbol, "expiry": expiry}),
                    )
                    .await?;

                let underlying_price = field_f64(&data, "underlying_price").unwrap_or(0.0);
                let parse_side = |key: &str| -> Vec<OptionLeg> {
                    data.get(key)
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

    async fn get_margin_rate(&self, symbol: &str) -> ProviderResult<f64> {
        let symbol = symbol.to_uppercase();
        self.guard
            .run(async {
                let data = self
                    .call("quote/margin_rate", json!({"symbol": symbol}))
                    .await?;
                Ok(data.get("margin_rate").and_then(value_f64))
            })
            .await
    }

    fn health_check(&self) -> ProviderStatus {
        if self.credentials.is_none() {
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

    fn with_credentials() -> Credentials {
        Credentials {
            tiger_id: Some("id-1".into()),
            tiger_account: Some("acct-1".into()),
            tiger_secret: Some("secret".into()),
            ..Default::default()
        }
    }

    #[test]
    fn missing_credentials_means_unavailable() {
        let settings = ProviderSettings::named("tiger");
        let adapter = TigerAdapter::new(&settings, &Credentials::default());
        assert_eq!(adapter.health_check(), ProviderStatus::Unavailable);
        assert!(!adapter.supports_symbol("AAPL"));
    }

    #[test]
    fn configured_adapter_reports_healthy() {
        let settings = ProviderSettings::named("tiger");
        let adapter = TigerAdapter::new(&settings, &with_credentials());
        assert_eq!(adapter.health_check(), ProviderStatus::Healthy);
        assert!(adapter.supports_symbol("AAPL"));
    }

    #[test]
    fn signing_is_deterministic() {
        let a = TigerAdapter::sign("secret", "id-1|quote|1700000000|{}");
        let b = TigerAdapter::sign("secret", "id-1|quote|1700000000|{}");
        let c = TigerAdapter::sign("other", "id-1|quote|1700000000|{}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}

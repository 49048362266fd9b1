//! Market-data provider adapters.
//!
//! One module per external source. Every adapter owns a
//! [`ProviderGuard`](crate::market::guard::ProviderGuard) and translates
//! source-specific payloads and errors into the normalized types and the
//! classified error taxonomy.

mod alphavantage;
mod dataset;
mod sina_commodity;
mod tiger;
mod tushare;
mod yahoo;

pub use alphavantage::AlphaVantageAdapter;
pub use dataset::LocalDatasetAdapter;
pub use sina_commodity::SinaCommodityAdapter;
pub use tiger::TigerAdapter;
pub use tushare::TushareAdapter;
pub use yahoo::YahooAdapter;

use serde_json::Value;
use std::time::Duration;

use super::errors::ProviderError;

pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
pub(crate) const USER_AGENT: &str = "MarketMind/1.0 (analysis backend)";

pub(crate) fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_default()
}

/// GET a JSON document, classifying transport and HTTP-status failures.
pub(crate) async fn http_get_json(
    client: &reqwest::Client,
    url: &str,
    query: &[(&str, String)],
) -> Result<Value, ProviderError> {
    let response = client
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|e| ProviderError::from_transport(&e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::from_status(status, &body));
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| ProviderError::from_transport(&e))
}

/// GET a text document, classifying transport and HTTP-status failures.
pub(crate) async fn http_get_text(
    client: &reqwest::Client,
    url: &str,
    query: &[(&str, String)],
) -> Result<String, ProviderError> {
    let response = client
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|e| ProviderError::from_transport(&e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::from_status(status, &body));
    }

    response
        .text()
        .await
        .map_err(|e| ProviderError::from_transport(&e))
}

/// Pull an f64 out of a JSON value that may be a number or numeric string.
pub(crate) fn value_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn value_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn field_f64(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(value_f64)
}

pub(crate) fn field_i64(v: &Value, key: &str) -> Option<i64> {
    v.get(key).and_then(value_i64)
}

pub(crate) fn field_str(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_strings_parse() {
        assert_eq!(value_f64(&json!("420.50")), Some(420.50));
        assert_eq!(value_f64(&json!(420.50)), Some(420.50));
        assert_eq!(value_f64(&json!(null)), None);
        assert_eq!(value_i64(&json!("1000")), Some(1000));
        assert_eq!(value_i64(&json!(10.7)), Some(10));
    }

    #[test]
    fn field_lookups() {
        let v = json!({"price": "1.5", "name": "Gold", "empty": ""});
        assert_eq!(field_f64(&v, "price"), Some(1.5));
        assert_eq!(field_str(&v, "name").as_deref(), Some("Gold"));
        assert_eq!(field_str(&v, "empty"), None);
        assert_eq!(field_str(&v, "missing"), None);
    }
}

//! Injected collaborators of the task engine.
//!
//! The engine treats analysis runners as pure functions: params in,
//! JSON payload out. Their internals (scoring, AI reports) live outside
//! the execution core. The quota hook is consulted once per task
//! creation; its counters belong to the quota layer, not to the engine.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::market::provider::HistoryRange;
use crate::market::MarketDataService;
use crate::models::TaskType;

/// Runs a full stock analysis for (ticker, style) and returns the
/// payload the history row and daily cache will carry.
#[async_trait]
pub trait StockAnalysisRunner: Send + Sync {
    async fn run(&self, ticker: &str, style: &str) -> Result<Value>;
}

/// Runs an options analysis, either over a whole chain (basic mode) or
/// for one contract (enhanced mode).
#[async_trait]
pub trait OptionsAnalysisRunner: Send + Sync {
    async fn run_chain(&self, symbol: &str, expiry_date: &str) -> Result<Value>;
    async fn run_enhanced(&self, symbol: &str, option_identifier: &str) -> Result<Value>;
}

/// Quota collaborator hook. Called exactly once per task creation; the
/// quota layer owns all usage counters.
#[async_trait]
pub trait QuotaService: Send + Sync {
    async fn check_and_deduct(&self, user_id: &str, task_type: TaskType) -> Result<()>;
}

/// Quota hook that always allows. Used when the embedding process has no
/// quota layer.
pub struct NoopQuota;

#[async_trait]
impl QuotaService for NoopQuota {
    async fn check_and_deduct(&self, _user_id: &str, _task_type: TaskType) -> Result<()> {
        Ok(())
    }
}

/// Reference stock runner that assembles raw market data through the
/// market-data service. It carries no scoring or valuation logic; real
/// deployments inject their own runner on top of the same service.
pub struct MarketDataStockRunner {
    service: MarketDataService,
}

impl MarketDataStockRunner {
    pub fn new(service: MarketDataService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl StockAnalysisRunner for MarketDataStockRunner {
    async fn run(&self, ticker: &str, style: &str) -> Result<Value> {
        let quote = self
            .service
            .get_quote(ticker, None)
            .await
            .ok_or_else(|| anyhow!("no quote available for {ticker}"))?;

        let info = self.service.get_info(ticker, None).await;
        let fundamentals = self.service.get_fundamentals(ticker, None).await;
        let history = self
            .service
            .get_history(ticker, &HistoryRange::period("3mo"), None)
            .await;

        let mut data = json!({
            "price": quote.current_price,
            "previous_close": quote.previous_close,
            "volume": quote.volume,
        });
        if let Some(info) = info {
            data["company"] = info.to_flat_json();
        }
        if let Some(fundamentals) = fundamentals {
            data["fundamentals"] = fundamentals.to_flat_json();
        }
        if let Some(history) = &history {
            data["history_points"] = json!(history.bars.len());
            data["period_high"] = json!(history
                .bars
                .iter()
                .map(|b| b.high)
                .fold(f64::MIN, f64::max));
            data["period_low"] = json!(history.bars.iter().map(|b| b.low).fold(f64::MAX, f64::min));
        }

        Ok(json!({
            "ticker": ticker,
            "style": style,
            "data": data,
            "source": quote.source,
        }))
    }
}

/// Reference options runner over the market-data service. Assembles the
/// chain (or one contract's leg) without any strategy scoring.
pub struct MarketDataOptionsRunner {
    service: MarketDataService,
}

impl MarketDataOptionsRunner {
    pub fn new(service: MarketDataService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl OptionsAnalysisRunner for MarketDataOptionsRunner {
    async fn run_chain(&self, symbol: &str, expiry_date: &str) -> Result<Value> {
        let chain = self
            .service
            .get_options_chain(symbol, expiry_date, None)
            .await
            .ok_or_else(|| anyhow!("no options chain available for {symbol} {expiry_date}"))?;

        Ok(json!({
            "symbol": symbol,
            "expiry_date": expiry_date,
            "underlying_price": chain.underlying_price,
            "calls": chain.calls.len(),
            "puts": chain.puts.len(),
            "chain": serde_json::to_value(&chain)?,
        }))
    }

    async fn run_enhanced(&self, symbol: &str, option_identifier: &str) -> Result<Value> {
        // The contract identifier embeds the expiry: SYMBOL + YYMMDD + C/P + strike
        let expiry = parse_expiry_from_identifier(option_identifier)
            .ok_or_else(|| anyhow!("bad option identifier: {option_identifier}"))?;

        let chain = self
            .service
            .get_options_chain(symbol, &expiry, None)
            .await
            .ok_or_else(|| anyhow!("no options chain available for {symbol} {expiry}"))?;

        Ok(json!({
            "symbol": symbol,
            "option_identifier": option_identifier,
            "expiry_date": expiry,
            "underlying_price": chain.underlying_price,
        }))
    }
}

/// OCC-style identifiers carry the expiry as YYMMDD after the root.
fn parse_expiry_from_identifier(identifier: &str) -> Option<String> {
    let digits_start = identifier.find(|c: char| c.is_ascii_digit())?;
    let tail = &identifier[digits_start..];
    if tail.len() < 6 {
        return None;
    }
    let (yy, rest) = tail.split_at(2);
    let (mm, rest) = rest.split_at(2);
    let (dd, _) = rest.split_at(2);
    let year: u32 = yy.parse().ok()?;
    let month: u32 = mm.parse().ok()?;
    let day: u32 = dd.parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some(format!("20{year:02}-{month:02}-{day:02}"))
}

/// Bundle of collaborators injected into the engine.
pub struct RunnerSet {
    pub stock: Arc<dyn StockAnalysisRunner>,
    pub options: Arc<dyn OptionsAnalysisRunner>,
    pub quota: Arc<dyn QuotaService>,
}

impl RunnerSet {
    /// Reference runners over a market-data service, no quota layer.
    pub fn reference(service: MarketDataService) -> Self {
        Self {
            stock: Arc::new(MarketDataStockRunner::new(service.clone())),
            options: Arc::new(MarketDataOptionsRunner::new(service)),
            quota: Arc::new(NoopQuota),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_parses_from_occ_identifier() {
        assert_eq!(
            parse_expiry_from_identifier("NVDA260918C00500000").as_deref(),
            Some("2026-09-18")
        );
        assert_eq!(
            parse_expiry_from_identifier("AAPL251219P00180000").as_deref(),
            Some("2025-12-19")
        );
        assert!(parse_expiry_from_identifier("NVDA").is_none());
        assert!(parse_expiry_from_identifier("NVDA26").is_none());
        assert!(parse_expiry_from_identifier("NVDA269999C1").is_none());
    }
}

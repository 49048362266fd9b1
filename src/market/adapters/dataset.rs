//! Local dataset adapter.
//!
//! Serves quotes, history, fundamentals, info and earnings for US
//! equities out of a local SQLite dataset file. Unlimited throughput and
//! no rate limits, at the cost of slightly stale data. No options, no
//! macro tickers.
//!
//! A missing or unreadable dataset file makes the adapter permanently
//! unavailable; the router excludes it and the process keeps running.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ProviderSettings;
use crate::market::detector::is_macro_ticker;
use crate::market::errors::ProviderError;
use crate::market::guard::{CircuitState, ProviderGuard};
use crate::market::provider::{guard_health, HistoryRange, MarketDataProvider, ProviderResult};
use crate::market::types::{
    CompanyInfo, DataType, EarningsData, EarningsRow, FundamentalsData, HistoryBar, HistorySeries,
    MarketKind, ProviderStatus, QuoteData,
};

const SUPPORTED_DATA_TYPES: [DataType; 5] = [
    DataType::Quote,
    DataType::History,
    DataType::Info,
    DataType::Fundamentals,
    DataType::Earnings,
];
const SUPPORTED_MARKETS: [MarketKind; 1] = [MarketKind::Us];

pub struct LocalDatasetAdapter {
    name: String,
    conn: Option<Arc<Mutex<Connection>>>,
    guard: ProviderGuard,
}

impl LocalDatasetAdapter {
    /// Open the dataset file. On failure the adapter stays registered but
    /// permanently unavailable.
    pub fn open(path: &str, settings: &ProviderSettings) -> Self {
        let conn = match Connection::open(path) {
            Ok(conn) => {
                info!(path, "local dataset opened");
                Some(Arc::new(Mutex::new(conn)))
            }
            Err(e) => {
                warn!(path, error = %e, "local dataset unavailable");
                None
            }
        };
        Self {
            name: settings.name.clone(),
            conn,
            guard: ProviderGuard::new(settings),
        }
    }

    /// Create the dataset schema on an open connection. Used by ingest
    /// tooling and test fixtures.
    pub fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS daily_bars (
                symbol TEXT NOT NULL,
                ts INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (symbol, ts)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS companies (
                symbol TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                sector TEXT, industry TEXT, country TEXT,
                description TEXT, employees INTEGER,
                website TEXT, currency TEXT, exchange TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS fundamentals (
                symbol TEXT PRIMARY KEY,
                pe_ratio REAL, forward_pe REAL, pb_ratio REAL, ps_ratio REAL,
                peg_ratio REAL, ev_ebitda REAL, profit_margin REAL,
                operating_margin REAL, roe REAL, roa REAL,
                revenue_growth REAL, earnings_growth REAL, beta REAL,
                dividend_yield REAL, eps_trailing REAL, eps_forward REAL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS quarterly_earnings (
                symbol TEXT NOT NULL,
                quarter TEXT NOT NULL,
                earnings REAL,
                revenue REAL,
                PRIMARY KEY (symbol, quarter)
            )",
            [],
        )?;
        Ok(())
    }

    fn connection(&self) -> Result<Arc<Mutex<Connection>>, ProviderError> {
        self.conn
            .as_ref()
            .cloned()
            .ok_or_else(|| ProviderError::Other("dataset file not available".to_string()))
    }

    fn period_to_days(period: &str) -> i64 {
        match period {
            "1d" => 1,
            "5d" => 5,
            "1mo" => 31,
            "3mo" => 93,
            "6mo" => 186,
            "1y" => 366,
            "2y" => 732,
            "5y" => 1830,
            "max" => 36500,
            _ => 31,
        }
    }
}

#[async_trait]
impl MarketDataProvider for LocalDatasetAdapter {
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
        // Plain US equities only; no indices or futures in the dataset
        self.conn.is_some() && !is_macro_ticker(symbol)
    }

    async fn get_quote(&self, symbol: &str) -> ProviderResult<QuoteData> {
        let symbol = symbol.to_uppercase();
        self.guard
            .run(async {
                let conn = self.connection()?;
                let conn = conn.lock().await;
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT ts, open, high, low, close, volume
                         FROM daily_bars WHERE symbol = ?1
                         ORDER BY ts DESC LIMIT 2",
                    )
                    .map_err(|e| ProviderError::Other(e.to_string()))?;

                let rows: Vec<(i64, f64, f64, f64, f64, i64)> = stmt
                    .query_map(params![symbol], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    })
                    .map_err(|e| ProviderError::Other(e.to_string()))?
                    .filter_map(|r| r.ok())
                    .collect();

                let latest = match rows.first() {
                    Some(r) => r,
                    None => return Ok(None),
                };

                Ok(Some(QuoteData {
                    symbol: symbol.clone(),
                    current_price: latest.4,
                    previous_close: rows.get(1).map(|r| r.4),
                    open_price: Some(latest.1),
                    day_high: Some(latest.2),
                    day_low: Some(latest.3),
                    volume: Some(latest.5),
                    market_cap: None,
                    timestamp: DateTime::<Utc>::from_timestamp(latest.0, 0),
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
                let (from_ts, to_ts) = match (&range.start, &range.end) {
                    (Some(start), end) => {
                        let from = start.and_hms_opt(0, 0, 0).map(|t| t.and_utc().timestamp());
                        let to = end
                            .as_ref()
                            .and_then(|e| e.and_hms_opt(23, 59, 59))
                            .map(|t| t.and_utc().timestamp())
                            .unwrap_or_else(|| Utc::now().timestamp());
                        (from.unwrap_or(0), to)
                    }
                    _ => {
                        let days = Self::period_to_days(range.period.as_deref().unwrap_or("1mo"));
                        let from = (Utc::now() - ChronoDuration::days(days)).timestamp();
                        (from, Utc::now().timestamp())
                    }
                };

                let conn = self.connection()?;
                let conn = conn.lock().await;
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT ts, open, high, low, close, volume
                         FROM daily_bars
                         WHERE symbol = ?1 AND ts >= ?2 AND ts <= ?3
                         ORDER BY ts ASC",
                    )
                    .map_err(|e| ProviderError::Other(e.to_string()))?;

                let bars: Vec<HistoryBar> = stmt
                    .query_map(params![symbol, from_ts, to_ts], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, f64>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, f64>(3)?,
                            row.get::<_, f64>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    })
                    .map_err(|e| ProviderError::Other(e.to_string()))?
                    .filter_map(|r| r.ok())
                    .filter_map(|(ts, open, high, low, close, volume)| {
                        Some(HistoryBar {
                            ts: DateTime::<Utc>::from_timestamp(ts, 0)?,
                            open,
                            high,
                            low,
                            close,
                            volume,
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

    async fn get_info(&self, symbol: &str) -> ProviderResult<CompanyInfo> {
        let symbol = symbol.to_uppercase();
        self.guard
            .run(async {
                let conn = self.connection()?;
                let conn = conn.lock().await;
                let info = conn
                    .query_row(
                        "SELECT name, sector, industry, country, description,
                                employees, website, currency, exchange
                         FROM companies WHERE symbol = ?1",
                        params![symbol],
                        |row| {
                            Ok(CompanyInfo {
                                symbol: symbol.clone(),
                                name: row.get(0)?,
                                sector: row.get(1)?,
                                industry: row.get(2)?,
                                country: row.get(3)?,
                                description: row.get(4)?,
                                employees: row.get(5)?,
                                website: row.get(6)?,
                                currency: row.get(7)?,
                                exchange: row.get(8)?,
                                source: self.name.clone(),
                            })
                        },
                    )
                    .optional()
                    .map_err(|e| ProviderError::Other(e.to_string()))?;
                Ok(info)
            })
            .await
    }

    async fn get_fundamentals(&self, symbol: &str) -> ProviderResult<FundamentalsData> {
        let symbol = symbol.to_uppercase();
        self.guard
            .run(async {
                let conn = self.connection()?;
                let conn = conn.lock().await;
                let fundamentals = conn
                    .query_row(
                        "SELECT pe_ratio, forward_pe, pb_ratio, ps_ratio, peg_ratio,
                                ev_ebitda, profit_margin, operating_margin, roe, roa,
                                revenue_growth, earnings_growth, beta, dividend_yield,
                                eps_trailing, eps_forward
                         FROM fundamentals WHERE symbol = ?1",
                        params![symbol],
                        |row| {
                            Ok(FundamentalsData {
                                symbol: symbol.clone(),
                                pe_ratio: row.get(0)?,
                                forward_pe: row.get(1)?,
                                pb_ratio: row.get(2)?,
                                ps_ratio: row.get(3)?,
                                peg_ratio: row.get(4)?,
                                ev_ebitda: row.get(5)?,
                                profit_margin: row.get(6)?,
                                operating_margin: row.get(7)?,
                                roe: row.get(8)?,
                                roa: row.get(9)?,
                                revenue_growth: row.get(10)?,
                                earnings_growth: row.get(11)?,
                                beta: row.get(12)?,
                                dividend_yield: row.get(13)?,
                                eps_trailing: row.get(14)?,
                                eps_forward: row.get(15)?,
                                target_high: None,
                                target_low: None,
                                target_mean: None,
                                recommendation: None,
                                source: self.name.clone(),
                            })
                        },
                    )
                    .optional()
                    .map_err(|e| ProviderError::Other(e.to_string()))?;
                Ok(fundamentals)
            })
            .await
    }

    async fn get_earnings(&self, symbol: &str) -> ProviderResult<EarningsData> {
        let symbol = symbol.to_uppercase();
        self.guard
            .run(async {
                let conn = self.connection()?;
                let conn = conn.lock().await;
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT quarter, earnings, revenue
                         FROM quarterly_earnings WHERE symbol = ?1
                         ORDER BY quarter ASC",
                    )
                    .map_err(|e| ProviderError::Other(e.to_string()))?;

                let rows: Vec<EarningsRow> = stmt
                    .query_map(params![symbol], |row| {
                        Ok(EarningsRow {
                            quarter: row.get(0)?,
                            earnings: row.get(1)?,
                            revenue: row.get(2)?,
                        })
                    })
                    .map_err(|e| ProviderError::Other(e.to_string()))?
                    .filter_map(|r| r.ok())
                    .collect();

                if rows.is_empty() {
                    return Ok(None);
                }
                Ok(Some(EarningsData {
                    symbol: symbol.clone(),
                    quarterly: rows,
                    source: self.name.clone(),
                }))
            })
            .await
    }

    fn health_check(&self) -> ProviderStatus {
        if self.conn.is_none() {
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
    use crate::config::ProviderSettings;

    fn seeded_adapter() -> (tempfile::TempDir, LocalDatasetAdapter) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.db");
        let path_str = path.to_str().unwrap().to_string();

        let conn = Connection::open(&path).unwrap();
        LocalDatasetAdapter::ensure_schema(&conn).unwrap();
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO daily_bars (symbol, ts, open, high, low, close, volume)
             VALUES ('AAPL', ?1, 193.0, 196.0, 192.5, 195.0, 1000000),
                    ('AAPL', ?2, 190.0, 194.0, 189.5, 193.2, 900000)",
            params![now, now - 86400],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO companies (symbol, name, sector) VALUES ('AAPL', 'Apple Inc.', 'Technology')",
            [],
        )
        .unwrap();
        drop(conn);

        let settings = ProviderSettings::named("dataset");
        (dir, LocalDatasetAdapter::open(&path_str, &settings))
    }

    #[tokio::test]
    async fn quote_uses_latest_bar() {
        let (_dir, adapter) = seeded_adapter();
        let quote = adapter.get_quote("aapl").await.unwrap().unwrap();
        assert_eq!(quote.current_price, 195.0);
        assert_eq!(quote.previous_close, Some(193.2));
        assert_eq!(quote.source, "dataset");
    }

    #[tokio::test]
    async fn history_returns_ascending_bars() {
        let (_dir, adapter) = seeded_adapter();
        let series = adapter
            .get_history("AAPL", &HistoryRange::period("1mo"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(series.bars.len(), 2);
        assert!(series.bars[0].ts < series.bars[1].ts);
    }

    #[tokio::test]
    async fn unknown_symbol_is_none_not_error() {
        let (_dir, adapter) = seeded_adapter();
        assert!(adapter.get_quote("ZZZZ").await.unwrap().is_none());
        assert!(adapter.get_info("ZZZZ").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_file_means_unavailable() {
        let settings = ProviderSettings::named("dataset");
        let adapter = LocalDatasetAdapter::open("/nonexistent/dir/data.db", &settings);
        assert_eq!(adapter.health_check(), ProviderStatus::Unavailable);
        assert!(!adapter.supports_symbol("AAPL"));
    }

    #[test]
    fn macro_tickers_are_not_supported() {
        let (_dir, adapter) = seeded_adapter();
        assert!(!adapter.supports_symbol("^VIX"));
        assert!(adapter.supports_symbol("AAPL"));
    }
}

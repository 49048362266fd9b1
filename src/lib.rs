//! MarketMind Backend Library
//!
//! Analysis execution core: the async analysis task engine and the
//! multi-provider market-data service. Exposed for use by the service
//! binary and integration tests.

pub mod config;
pub mod db;
pub mod market;
pub mod models;
pub mod tasks;

// Re-export the most commonly used handles at crate root
pub use db::AnalysisStore;
pub use market::service::MarketDataService;
pub use tasks::engine::TaskEngine;

//! Service configuration.
//!
//! Layered: compiled defaults -> optional TOML file -> environment
//! overrides. Credentials are only ever read from the environment.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::market::types::{DataType, MarketKind};

/// Top-level configuration for the analysis core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Path to the SQLite database file
    pub database_path: String,

    /// Task engine settings
    pub engine: EngineSettings,

    /// Market-data cache settings
    pub cache: CacheSettings,

    /// Request deduplication settings
    pub dedup: DedupSettings,

    /// Per-provider settings keyed by provider name
    pub providers: HashMap<String, ProviderSettings>,

    /// Provider credentials (populated from the environment only)
    #[serde(skip)]
    pub credentials: Credentials,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: "marketmind.db".into(),
            engine: EngineSettings::default(),
            cache: CacheSettings::default(),
            dedup: DedupSettings::default(),
            providers: default_provider_settings(),
            credentials: Credentials::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then an optional TOML file, then
    /// environment overrides.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)?;
                toml::from_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MARKETMIND_DB_PATH") {
            self.database_path = v;
        }
        if let Ok(v) = std::env::var("MARKETMIND_MAX_WORKERS") {
            if let Ok(n) = v.parse() {
                self.engine.max_workers = n;
            }
        }
        if let Ok(v) = std::env::var("MARKETMIND_CACHE_DISABLED") {
            if v == "1" || v.eq_ignore_ascii_case("true") {
                self.cache.memory_enabled = false;
            }
        }

        self.credentials = Credentials::from_env();

        // Providers that cannot work without credentials are disabled up
        // front so the router never considers them.
        if self.credentials.alpha_vantage_key.is_none() {
            if let Some(p) = self.providers.get_mut("alphavantage") {
                p.enabled = false;
            }
        }
        if self.credentials.tushare_token.is_none() {
            if let Some(p) = self.providers.get_mut("tushare") {
                p.enabled = false;
            }
        }
    }

    /// Settings for a provider, falling back to defaults for unknown names.
    pub fn provider(&self, name: &str) -> ProviderSettings {
        self.providers
            .get(name)
            .cloned()
            .unwrap_or_else(|| ProviderSettings::named(name))
    }
}

/// Provider API credentials, environment-only.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub alpha_vantage_key: Option<String>,
    pub tushare_token: Option<String>,
    pub tiger_id: Option<String>,
    pub tiger_account: Option<String>,
    pub tiger_secret: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        let get = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());
        Self {
            alpha_vantage_key: get("ALPHA_VANTAGE_API_KEY"),
            tushare_token: get("TUSHARE_TOKEN"),
            tiger_id: get("TIGER_ID"),
            tiger_account: get("TIGER_ACCOUNT"),
            tiger_secret: get("TIGER_SECRET"),
        }
    }
}

/// Task engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Worker pool size
    pub max_workers: usize,
    /// Worker dequeue timeout (seconds)
    pub queue_poll_timeout_seconds: u64,
    /// WAITING task total timeout (seconds)
    pub waiting_max_wait_seconds: u64,
    /// WAITING task cache poll cadence (seconds)
    pub waiting_poll_interval_seconds: u64,
    /// Total wall time of the cached-playback progress schedule (seconds).
    /// The reference schedule is scaled to this duration.
    pub cached_playback_seconds: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_workers: 3,
            queue_poll_timeout_seconds: 1,
            waiting_max_wait_seconds: 300,
            waiting_poll_interval_seconds: 2,
            cached_playback_seconds: 9.5,
        }
    }
}

impl EngineSettings {
    pub fn queue_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_poll_timeout_seconds)
    }
    pub fn waiting_poll_interval(&self) -> Duration {
        Duration::from_secs(self.waiting_poll_interval_seconds)
    }
}

/// Market-data cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Global switch; when false all lookups miss and sets are no-ops
    pub memory_enabled: bool,
    /// LRU capacity before eviction
    pub memory_max_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            memory_enabled: true,
            memory_max_size: 1000,
        }
    }
}

/// Request deduplication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    /// Grace period after completion before the inflight entry is removed
    pub window_ms: u64,
    /// Max wait for a sibling inflight request (seconds)
    pub wait_timeout_seconds: u64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            window_ms: 500,
            wait_timeout_seconds: 30,
        }
    }
}

impl DedupSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_seconds)
    }
}

/// Per-(provider, data-type) cache TTLs in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderTtl {
    pub quote: u64,
    pub history: u64,
    pub fundamentals: u64,
    pub info: u64,
    pub options_chain: u64,
    pub options_expirations: u64,
    pub earnings: u64,
    #[serde(rename = "macro")]
    pub macro_data: u64,
}

impl Default for ProviderTtl {
    fn default() -> Self {
        Self {
            quote: 60,
            history: 300,
            fundamentals: 3600,
            info: 86400,
            options_chain: 120,
            options_expirations: 300,
            earnings: 3600,
            macro_data: 60,
        }
    }
}

impl ProviderTtl {
    pub fn ttl_for(&self, data_type: DataType) -> Duration {
        let secs = match data_type {
            DataType::Quote => self.quote,
            DataType::History => self.history,
            DataType::Fundamentals => self.fundamentals,
            DataType::Info => self.info,
            DataType::OptionsChain => self.options_chain,
            DataType::OptionsExpirations => self.options_expirations,
            DataType::Earnings => self.earnings,
            DataType::Macro => self.macro_data,
        };
        Duration::from_secs(secs)
    }
}

/// Settings for a single market-data provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub name: String,
    pub enabled: bool,
    /// Router ordering; lower = preferred
    pub priority: i64,
    /// Advisory; enforced inside the adapter
    pub requests_per_minute: u32,
    /// Rate-limit cooldown after classified rate-limit errors
    pub cooldown_on_error_seconds: u64,
    /// Consecutive failures before cooldown entry
    pub max_consecutive_failures: u32,
    /// Concurrency semaphore size
    pub max_concurrent: usize,
    /// Failures before the circuit opens
    pub circuit_failure_threshold: u32,
    /// Consecutive HALF_OPEN successes to close the circuit
    pub circuit_success_threshold: u32,
    pub cache_ttl: ProviderTtl,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            priority: 100,
            requests_per_minute: 60,
            cooldown_on_error_seconds: 60,
            max_consecutive_failures: 3,
            max_concurrent: 10,
            circuit_failure_threshold: 5,
            circuit_success_threshold: 3,
            cache_ttl: ProviderTtl::default(),
        }
    }
}

impl ProviderSettings {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_on_error_seconds)
    }
}

/// Default provider table. Priorities and TTLs reflect each source's
/// freshness and rate-limit behavior.
pub fn default_provider_settings() -> HashMap<String, ProviderSettings> {
    let mut map = HashMap::new();

    map.insert(
        "yahoo".to_string(),
        ProviderSettings {
            name: "yahoo".into(),
            priority: 10,
            requests_per_minute: 100,
            cooldown_on_error_seconds: 60,
            max_consecutive_failures: 3,
            cache_ttl: ProviderTtl::default(),
            ..Default::default()
        },
    );

    map.insert(
        "dataset".to_string(),
        ProviderSettings {
            name: "dataset".into(),
            priority: 20,
            requests_per_minute: 1000,
            cooldown_on_error_seconds: 30,
            max_consecutive_failures: 5,
            cache_ttl: ProviderTtl {
                quote: 120,
                history: 600,
                fundamentals: 7200,
                info: 172800,
                earnings: 7200,
                macro_data: 120,
                ..Default::default()
            },
            ..Default::default()
        },
    );

    map.insert(
        "tiger".to_string(),
        ProviderSettings {
            name: "tiger".into(),
            priority: 15,
            requests_per_minute: 60,
            cooldown_on_error_seconds: 60,
            max_consecutive_failures: 3,
            cache_ttl: ProviderTtl {
                options_chain: 90,
                options_expirations: 180,
                ..Default::default()
            },
            ..Default::default()
        },
    );

    map.insert(
        "alphavantage".to_string(),
        ProviderSettings {
            name: "alphavantage".into(),
            priority: 25,
            requests_per_minute: 5,
            cooldown_on_error_seconds: 120,
            max_consecutive_failures: 2,
            cache_ttl: ProviderTtl {
                quote: 300,
                history: 900,
                fundamentals: 7200,
                info: 172800,
                macro_data: 300,
                ..Default::default()
            },
            ..Default::default()
        },
    );

    map.insert(
        "tushare".to_string(),
        ProviderSettings {
            name: "tushare".into(),
            priority: 10,
            requests_per_minute: 200,
            cooldown_on_error_seconds: 60,
            max_consecutive_failures: 3,
            cache_ttl: ProviderTtl {
                quote: 120,
                history: 600,
                macro_data: 120,
                ..Default::default()
            },
            ..Default::default()
        },
    );

    map.insert(
        "sina_commodity".to_string(),
        ProviderSettings {
            name: "sina_commodity".into(),
            priority: 10,
            requests_per_minute: 30,
            cooldown_on_error_seconds: 60,
            max_consecutive_failures: 3,
            cache_ttl: ProviderTtl {
                quote: 120,
                history: 600,
                macro_data: 120,
                ..Default::default()
            },
            ..Default::default()
        },
    );

    map
}

/// Timezone name for a market, used when normalizing history timestamps.
pub fn timezone_for_market(market: MarketKind) -> &'static str {
    match market {
        MarketKind::Us => "America/New_York",
        MarketKind::Hk => "Asia/Hong_Kong",
        MarketKind::Cn | MarketKind::Commodity => "Asia/Shanghai",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_all_known_providers() {
        let config = AppConfig::default();
        for name in [
            "yahoo",
            "dataset",
            "tiger",
            "alphavantage",
            "tushare",
            "sina_commodity",
        ] {
            let p = config.provider(name);
            assert!(p.enabled, "{name} should default to enabled");
            assert!(p.priority > 0);
        }
    }

    #[test]
    fn unknown_provider_gets_generic_defaults() {
        let config = AppConfig::default();
        let p = config.provider("mystery");
        assert_eq!(p.priority, 100);
        assert_eq!(p.max_concurrent, 10);
    }

    #[test]
    fn ttl_lookup_matches_data_type() {
        let ttl = ProviderTtl::default();
        assert_eq!(ttl.ttl_for(DataType::Quote), Duration::from_secs(60));
        assert_eq!(ttl.ttl_for(DataType::Info), Duration::from_secs(86400));
    }
}

//! Classified provider errors.
//!
//! Adapters never leak raw transport errors to the router: every failure
//! is classified here so the protection layer can decide whether it
//! counts against the provider's health.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The source throttled us (HTTP 429, explicit throttle message, or an
    /// empty/undecodable body typical of throttled responses).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Transport-level connectivity problem.
    #[error("network error: {0}")]
    Network(String),

    /// The symbol is unknown to this source. Not a provider failure.
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    /// No concurrency slot became available within the acquire timeout.
    #[error("timed out waiting for a request slot")]
    ConcurrencyTimeout,

    /// The circuit breaker is open; the call was not attempted.
    #[error("circuit open")]
    CircuitOpen,

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Classify a message the way the wire usually phrases it.
    pub fn from_message(msg: &str) -> Self {
        let lower = msg.to_lowercase();

        const RATE_LIMIT_HINTS: [&str; 6] = [
            "too many requests",
            "rate limit",
            "429",
            "quota exceeded",
            "throttl",
            "max retries exceeded",
        ];
        if RATE_LIMIT_HINTS.iter().any(|h| lower.contains(h)) {
            return ProviderError::RateLimited(msg.to_string());
        }
        // Undecodable empty bodies are the usual shape of a silent throttle
        if lower.contains("expecting value") {
            return ProviderError::RateLimited(msg.to_string());
        }

        const NETWORK_HINTS: [&str; 8] = [
            "connection refused",
            "connection reset",
            "connection timeout",
            "network is unreachable",
            "name resolution",
            "ssl",
            "eof occurred",
            "remote end closed",
        ];
        if NETWORK_HINTS.iter().any(|h| lower.contains(h)) {
            return ProviderError::Network(msg.to_string());
        }

        const INVALID_HINTS: [&str; 6] = [
            "no data found",
            "symbol not found",
            "invalid symbol",
            "unknown symbol",
            "delisted",
            "no price data",
        ];
        if INVALID_HINTS.iter().any(|h| lower.contains(h)) {
            return ProviderError::InvalidSymbol(msg.to_string());
        }

        ProviderError::Other(msg.to_string())
    }

    /// Classify a reqwest transport error.
    pub fn from_transport(e: &reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            if status.as_u16() == 429 {
                return ProviderError::RateLimited(e.to_string());
            }
        }
        if e.is_timeout() || e.is_connect() {
            return ProviderError::Network(e.to_string());
        }
        if e.is_decode() {
            // Empty throttled responses fail JSON decoding
            return ProviderError::RateLimited(e.to_string());
        }
        Self::from_message(&e.to_string())
    }

    /// Classify an HTTP status + body from a source that returned an
    /// error response rather than failing at the transport layer.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        if status.as_u16() == 429 {
            return ProviderError::RateLimited(format!("HTTP 429: {body}"));
        }
        if status.is_server_error() {
            return ProviderError::Network(format!("HTTP {status}: {body}"));
        }
        if status.as_u16() == 404 {
            return ProviderError::InvalidSymbol(format!("HTTP 404: {body}"));
        }
        Self::from_message(&format!("HTTP {status}: {body}"))
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ProviderError::RateLimited(_))
    }

    /// Whether this error increments failure counters. Invalid symbols and
    /// circuit-open short-circuits do not.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            ProviderError::InvalidSymbol(_) | ProviderError::CircuitOpen
        )
    }

    /// Short tag for metrics records.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProviderError::RateLimited(_) => "rate_limited",
            ProviderError::Network(_) => "network",
            ProviderError::InvalidSymbol(_) => "invalid_symbol",
            ProviderError::ConcurrencyTimeout => "timeout",
            ProviderError::CircuitOpen => "circuit_open",
            ProviderError::Other(_) => "unknown",
        }
    }
}

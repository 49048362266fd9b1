//! Per-provider protection layer.
//!
//! Every outgoing adapter call passes through three independent
//! mechanisms: a concurrency semaphore, a rate-limit cooldown tracker,
//! and a circuit breaker. The adapter owns this state; the router only
//! reads it.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::errors::ProviderError;
use crate::config::ProviderSettings;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Three-state circuit breaker.
///
/// Closed -> Open after `failure_threshold` consecutive failures. Open
/// blocks until `timeout` elapses, then the next state read transitions
/// to HalfOpen. HalfOpen: one failure reopens (timer reset),
/// `success_threshold` consecutive successes close.
pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            timeout,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Current state. Reading from Open past the timeout transitions to
    /// HalfOpen.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            if let Some(at) = inner.last_failure {
                if at.elapsed() >= self.timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    info!("circuit breaker transitioning to HALF_OPEN");
                }
            }
        }
        inner.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.success_count += 1;
            if inner.success_count >= self.success_threshold {
                inner.state = CircuitState::Closed;
                info!("circuit breaker CLOSED, provider recovered");
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!("circuit breaker OPEN, failure during recovery probe");
            }
            CircuitState::Closed => {
                if inner.failure_count >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        failures = inner.failure_count,
                        "circuit breaker OPEN, consecutive failure threshold reached"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
    }
}

struct RateLimitInner {
    limited_until: Option<Instant>,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
}

/// Tracks rate-limit cooldown status for a provider.
pub struct RateLimitTracker {
    cooldown: Duration,
    max_consecutive_failures: u32,
    inner: Mutex<RateLimitInner>,
}

impl RateLimitTracker {
    pub fn new(cooldown: Duration, max_consecutive_failures: u32) -> Self {
        Self {
            cooldown,
            max_consecutive_failures,
            inner: Mutex::new(RateLimitInner {
                limited_until: None,
                consecutive_failures: 0,
                last_failure: None,
                last_success: None,
            }),
        }
    }

    /// Whether the cooldown is still active. Expiry is lazy: the flag
    /// clears on the first check past `cooldown_until`.
    pub fn is_rate_limited(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.limited_until {
            Some(until) if Instant::now() >= until => {
                inner.limited_until = None;
                inner.consecutive_failures = 0;
                info!("rate limit cooldown expired, resuming normal operation");
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn mark_rate_limited(&self) {
        let mut inner = self.inner.lock();
        inner.limited_until = Some(Instant::now() + self.cooldown);
        warn!(
            cooldown_secs = self.cooldown.as_secs(),
            "rate limit triggered, entering cooldown"
        );
    }

    /// Record a failure; entering cooldown once the consecutive-failure
    /// threshold is reached.
    pub fn mark_failure(&self) {
        let trip = {
            let mut inner = self.inner.lock();
            inner.consecutive_failures += 1;
            inner.last_failure = Some(Instant::now());
            inner.consecutive_failures >= self.max_consecutive_failures
        };
        if trip {
            warn!("too many consecutive failures, entering cooldown");
            self.mark_rate_limited();
        }
    }

    pub fn mark_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.last_success = Some(Instant::now());
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.limited_until = None;
        inner.consecutive_failures = 0;
    }
}

/// Composite protection wrapper owned by each adapter.
pub struct ProviderGuard {
    name: String,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    acquire_timeout: Duration,
    rate_limit: RateLimitTracker,
    circuit: CircuitBreaker,
}

impl ProviderGuard {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            name: settings.name.clone(),
            semaphore: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
            max_concurrent: settings.max_concurrent.max(1),
            acquire_timeout: Duration::from_secs(30),
            rate_limit: RateLimitTracker::new(
                settings.cooldown(),
                settings.max_consecutive_failures,
            ),
            circuit: CircuitBreaker::new(
                settings.circuit_failure_threshold,
                settings.circuit_success_threshold,
                settings.cooldown(),
            ),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limit.is_rate_limited()
    }

    pub fn is_circuit_open(&self) -> bool {
        self.circuit.is_open()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.rate_limit.consecutive_failures()
    }

    /// Number of requests currently holding a concurrency slot.
    pub fn active_requests(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn reset(&self) {
        self.rate_limit.reset();
        self.circuit.reset();
    }

    /// Execute one provider call under the full protection stack.
    ///
    /// Classified failures update the cooldown tracker and circuit
    /// breaker; invalid-symbol outcomes leave health untouched.
    pub async fn run<T, F>(&self, fut: F) -> Result<Option<T>, ProviderError>
    where
        F: Future<Output = Result<Option<T>, ProviderError>>,
    {
        if self.circuit.is_open() {
            debug!(provider = %self.name, "circuit open, skipping request");
            return Err(ProviderError::CircuitOpen);
        }

        let permit = match tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                warn!(provider = %self.name, "concurrency limit reached, request timed out");
                return Err(ProviderError::ConcurrencyTimeout);
            }
        };

        let result = fut.await;
        drop(permit);

        match &result {
            Ok(_) => {
                self.rate_limit.mark_success();
                self.circuit.record_success();
            }
            Err(e) => {
                if e.is_rate_limit() {
                    self.rate_limit.mark_rate_limited();
                    self.circuit.record_failure();
                } else if e.counts_as_failure() {
                    self.rate_limit.mark_failure();
                    self.circuit.record_failure();
                }
            }
        }

        result
    }
}

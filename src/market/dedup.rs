//! Single-flight request deduplication.
//!
//! Concurrent identical requests share one underlying fetch: the first
//! caller installs an in-flight entry and runs the fetch; everyone else
//! blocks on its completion signal and receives the shared result. The
//! entry lingers for a short grace window after completion so
//! near-simultaneous callers can still coalesce.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

use super::types::CachedValue;
use crate::config::DedupSettings;

/// Shared outcome of one underlying fetch.
pub type SharedResult = Result<Option<CachedValue>, String>;

struct InFlight {
    started_at: Instant,
    done_rx: watch::Receiver<bool>,
    done_tx: Mutex<Option<watch::Sender<bool>>>,
    result: Mutex<Option<SharedResult>>,
}

/// What happened from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// This caller owned the underlying fetch
    Owner,
    /// This caller joined an in-flight fetch
    Joined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupError {
    /// Waited past the configured timeout for the in-flight fetch
    WaitTimeout,
}

#[derive(Debug, Default, Clone)]
pub struct DedupStats {
    pub requests: u64,
    pub deduplicated: u64,
    pub underlying_calls: u64,
}

impl DedupStats {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "requests": self.requests,
            "deduplicated": self.deduplicated,
            "underlying_calls": self.underlying_calls,
        })
    }
}

pub struct RequestDeduplicator {
    window: Duration,
    wait_timeout: Duration,
    in_flight: Arc<Mutex<HashMap<String, Arc<InFlight>>>>,
    stats: Mutex<DedupStats>,
}

/// Canonical dedup key: data type, uppercased symbol, and the sorted
/// non-null parameters. Two requests differing only in parameter order
/// share a key.
pub fn make_dedup_key(data_type: &str, symbol: &str, params: &[(&str, Option<String>)]) -> String {
    let mut kv: Vec<(String, String)> = params
        .iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone())))
        .collect();
    kv.sort();
    let params_part = kv
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{}:{}:{}", data_type, symbol.to_uppercase(), params_part)
}

impl RequestDeduplicator {
    pub fn new(settings: &DedupSettings) -> Self {
        Self {
            window: settings.window(),
            wait_timeout: settings.wait_timeout(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            stats: Mutex::new(DedupStats::default()),
        }
    }

    /// Execute a fetch with deduplication.
    ///
    /// The lock is only held to inspect or install the map entry, never
    /// across the fetch or the wait.
    pub async fn execute<F>(
        &self,
        key: String,
        fetch: F,
    ) -> (Result<SharedResult, DedupError>, DedupOutcome)
    where
        F: Future<Output = SharedResult>,
    {
        self.stats.lock().requests += 1;

        // Double-check-then-wait: decide owner/waiter under the lock,
        // release it before doing either. Completed entries still inside
        // the grace window do not satisfy new callers; they are replaced.
        let (entry, is_owner) = {
            let mut map = self.in_flight.lock();
            match map.get(&key) {
                Some(existing) if !*existing.done_rx.borrow() => {
                    (Arc::clone(existing), false)
                }
                _ => {
                    let (tx, rx) = watch::channel(false);
                    let entry = Arc::new(InFlight {
                        started_at: Instant::now(),
                        done_rx: rx,
                        done_tx: Mutex::new(Some(tx)),
                        result: Mutex::new(None),
                    });
                    map.insert(key.clone(), Arc::clone(&entry));
                    (entry, true)
                }
            }
        };

        if !is_owner {
            self.stats.lock().deduplicated += 1;
            debug!(key, "joining in-flight request");

            let mut rx = entry.done_rx.clone();
            let wait = async {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            };
            if tokio::time::timeout(self.wait_timeout, wait).await.is_err() {
                return (Err(DedupError::WaitTimeout), DedupOutcome::Joined);
            }

            let shared = entry
                .result
                .lock()
                .clone()
                .unwrap_or_else(|| Err("in-flight request vanished".to_string()));
            return (Ok(shared), DedupOutcome::Joined);
        }

        // Owner path: run the fetch, publish the result, signal waiters,
        // schedule removal after the grace window.
        self.stats.lock().underlying_calls += 1;
        debug!(key, "new in-flight request");
        let result = fetch.await;

        *entry.result.lock() = Some(result.clone());
        if let Some(tx) = entry.done_tx.lock().take() {
            let _ = tx.send(true);
        }
        self.schedule_cleanup(key);

        (Ok(result), DedupOutcome::Owner)
    }

    fn schedule_cleanup(&self, key: String) {
        let map = Arc::clone(&self.in_flight);
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut map = map.lock();
            // A newer fetch may have replaced the entry; only completed
            // entries are removed.
            if map.get(&key).map_or(false, |e| *e.done_rx.borrow()) {
                map.remove(&key);
            }
        });
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Age of the oldest in-flight entry, for diagnostics.
    pub fn oldest_in_flight(&self) -> Option<Duration> {
        self.in_flight
            .lock()
            .values()
            .map(|e| e.started_at.elapsed())
            .max()
    }

    pub fn stats(&self) -> DedupStats {
        self.stats.lock().clone()
    }

    /// Drop all in-flight entries (tests only).
    pub fn clear(&self) {
        self.in_flight.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::QuoteData;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quote(price: f64) -> CachedValue {
        CachedValue::Quote(QuoteData {
            symbol: "NVDA".into(),
            current_price: price,
            previous_close: None,
            open_price: None,
            day_high: None,
            day_low: None,
            volume: None,
            market_cap: None,
            timestamp: None,
            source: "test".into(),
        })
    }

    fn dedup() -> Arc<RequestDeduplicator> {
        Arc::new(RequestDeduplicator::new(&DedupSettings::default()))
    }

    #[test]
    fn keys_are_order_insensitive() {
        let a = make_dedup_key(
            "history",
            "aapl",
            &[("period", Some("1mo".into())), ("end", None), ("start", Some("2024-01-01".into()))],
        );
        let b = make_dedup_key(
            "history",
            "AAPL",
            &[("start", Some("2024-01-01".into())), ("period", Some("1mo".into()))],
        );
        assert_eq!(a, b);

        let c = make_dedup_key("quote", "AAPL", &[]);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn hundred_concurrent_callers_share_one_fetch() {
        let dedup = dedup();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let dedup = Arc::clone(&dedup);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                let (result, _) = dedup
                    .execute("quote:NVDA:".to_string(), async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Some(quote(500.0)))
                    })
                    .await;
                result.unwrap().unwrap().unwrap().as_quote().unwrap().current_price
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 500.0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "exactly one underlying fetch");

        let stats = dedup.stats();
        assert_eq!(stats.requests, 100);
        assert_eq!(stats.underlying_calls, 1);
        assert_eq!(stats.deduplicated, 99);
    }

    #[tokio::test]
    async fn waiters_see_the_shared_error() {
        let dedup = dedup();

        let d2 = Arc::clone(&dedup);
        let waiter = tokio::spawn(async move {
            // Give the owner a moment to install the entry
            tokio::time::sleep(Duration::from_millis(10)).await;
            let (result, outcome) = d2
                .execute("quote:FAIL:".to_string(), async {
                    panic!("waiter must never run the fetch")
                })
                .await;
            (result.unwrap(), outcome)
        });

        let (owner_result, owner_outcome) = dedup
            .execute("quote:FAIL:".to_string(), async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err("boom".to_string())
            })
            .await;

        assert_eq!(owner_outcome, DedupOutcome::Owner);
        assert_eq!(owner_result.unwrap().unwrap_err(), "boom");

        let (waiter_result, waiter_outcome) = waiter.await.unwrap();
        assert_eq!(waiter_outcome, DedupOutcome::Joined);
        assert_eq!(waiter_result.unwrap_err(), "boom");
    }

    #[tokio::test]
    async fn entry_is_removed_after_grace_window() {
        let dedup = Arc::new(RequestDeduplicator::new(&DedupSettings {
            window_ms: 20,
            wait_timeout_seconds: 30,
        }));

        let (_, _) = dedup
            .execute("quote:AAPL:".to_string(), async { Ok(Some(quote(1.0))) })
            .await;
        assert_eq!(dedup.in_flight_count(), 1, "entry lingers through the grace window");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(dedup.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn sequential_calls_each_fetch_after_window() {
        let dedup = Arc::new(RequestDeduplicator::new(&DedupSettings {
            window_ms: 1,
            wait_timeout_seconds: 30,
        }));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let (result, outcome) = dedup
                .execute("quote:AAPL:".to_string(), async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(quote(1.0)))
                })
                .await;
            assert!(result.unwrap().unwrap().is_some());
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(outcome, DedupOutcome::Owner);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

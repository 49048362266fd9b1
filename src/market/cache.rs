//! In-memory market-data cache.
//!
//! A thread-safe LRU with per-entry TTLs. Expired entries are treated as
//! misses and removed lazily on access. The cache can be globally
//! disabled, in which case every lookup misses and sets are no-ops.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use super::types::{CachedValue, DataType};
use crate::config::CacheSettings;

struct Entry {
    value: CachedValue,
    created_at: Instant,
    ttl: Duration,
    source: String,
    last_used: u64,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub max_size: usize,
}

impl CacheStats {
    pub fn to_json(&self) -> serde_json::Value {
        let total = self.hits + self.misses;
        json!({
            "hits": self.hits,
            "misses": self.misses,
            "hit_rate": if total > 0 { self.hits as f64 / total as f64 * 100.0 } else { 0.0 },
            "evictions": self.evictions,
            "size": self.size,
            "max_size": self.max_size,
        })
    }
}

struct CacheInner {
    entries: HashMap<String, Entry>,
    access_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// LRU cache keyed `"<data_type>:<cache_key>"`.
pub struct MarketCache {
    enabled: bool,
    max_size: usize,
    inner: Mutex<CacheInner>,
}

impl MarketCache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            enabled: settings.memory_enabled,
            max_size: settings.memory_max_size.max(1),
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                access_seq: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    fn make_key(cache_key: &str, data_type: DataType) -> String {
        format!("{}:{}", data_type.as_str(), cache_key)
    }

    pub fn get(&self, cache_key: &str, data_type: DataType) -> Option<CachedValue> {
        if !self.enabled {
            return None;
        }
        let key = Self::make_key(cache_key, data_type);
        let mut inner = self.inner.lock();
        inner.access_seq += 1;
        let seq = inner.access_seq;

        let found = match inner.entries.get_mut(&key) {
            Some(entry) if !entry.is_expired() => {
                entry.last_used = seq;
                Some((entry.value.clone(), entry.created_at.elapsed().as_secs_f64()))
            }
            Some(_) => {
                inner.entries.remove(&key);
                None
            }
            None => None,
        };

        match found {
            Some((value, age)) => {
                inner.hits += 1;
                debug!(key, age_secs = age, "cache hit");
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn set(&self, cache_key: &str, value: CachedValue, data_type: DataType, ttl: Duration, source: &str) {
        if !self.enabled {
            return;
        }
        let key = Self::make_key(cache_key, data_type);
        let mut inner = self.inner.lock();
        inner.access_seq += 1;
        let seq = inner.access_seq;

        inner.entries.remove(&key);
        while inner.entries.len() >= self.max_size {
            // Evict the least recently used entry
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
                inner.evictions += 1;
            } else {
                break;
            }
        }

        debug!(key, ttl_secs = ttl.as_secs(), source, "cache set");
        inner.entries.insert(
            key,
            Entry {
                value,
                created_at: Instant::now(),
                ttl,
                source: source.to_string(),
                last_used: seq,
            },
        );
    }

    pub fn delete(&self, cache_key: &str, data_type: DataType) -> bool {
        let key = Self::make_key(cache_key, data_type);
        self.inner.lock().entries.remove(&key).is_some()
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
        debug!("cache cleared");
    }

    /// Drop every entry whose cache key starts with the given symbol.
    pub fn clear_for_symbol(&self, symbol: &str) -> usize {
        let upper = symbol.to_uppercase();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| {
            // Keys look like "<data_type>:<SYMBOL>[:params]"
            match key.split_once(':') {
                Some((_, rest)) => {
                    !(rest == upper || rest.starts_with(&format!("{upper}:")))
                }
                None => true,
            }
        });
        before - inner.entries.len()
    }

    /// Remove every expired entry; returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.is_expired());
        before - inner.entries.len()
    }

    /// Source provider recorded for a live entry, if any.
    pub fn source_of(&self, cache_key: &str, data_type: DataType) -> Option<String> {
        let key = Self::make_key(cache_key, data_type);
        let inner = self.inner.lock();
        inner
            .entries
            .get(&key)
            .filter(|e| !e.is_expired())
            .map(|e| e.source.clone())
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            size: inner.entries.len(),
            max_size: self.max_size,
        }
    }
}

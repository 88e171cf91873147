//! Fingerprint-keyed decision cache
//!
//! Entries expire after a fixed TTL and the store is bounded: inserting past
//! capacity evicts the least-recently-inserted entry. Lookup, insertion, and
//! eviction all happen under one lock so a reader never observes a
//! half-evicted store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::types::{MarketSnapshot, Trend};

/// Which request shape a cached value answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    Ensemble,
    Single,
}

/// Coarse market state used as the cache key.
///
/// Price keeps three significant figures and volume two, so snapshots a
/// few ticks apart share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketFingerprint {
    pub symbol: String,
    pub price: String,
    pub volume: String,
    pub trend: Trend,
    pub mode: CacheMode,
}

impl MarketFingerprint {
    pub fn new(symbol: &str, snapshot: &MarketSnapshot, mode: CacheMode) -> Self {
        Self {
            symbol: symbol.to_ascii_uppercase(),
            price: format!("{:.2e}", snapshot.price),
            volume: format!("{:.1e}", snapshot.volume),
            trend: snapshot.trend,
            mode,
        }
    }

    /// Flat string form, used in logs and events.
    pub fn key(&self) -> String {
        let mode = match self.mode {
            CacheMode::Ensemble => "ensemble",
            CacheMode::Single => "single",
        };
        format!(
            "{}:{}:{}:{}:{}",
            self.symbol, self.price, self.volume, self.trend, mode
        )
    }
}

/// Counters for cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// A value served from the cache and how often its entry has been hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit<V> {
    pub value: V,
    pub hits: u64,
    pub age: Duration,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    hits: u64,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<MarketFingerprint, CacheEntry<V>>,
    order: VecDeque<MarketFingerprint>,
    stats: CacheStats,
}

/// Bounded TTL cache keyed by [`MarketFingerprint`].
#[derive(Debug)]
pub struct DecisionCache<V> {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> DecisionCache<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ttl,
            capacity,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                stats: CacheStats {
                    capacity,
                    ..Default::default()
                },
            }),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs), config.capacity)
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a live entry, counting the hit. Expired entries are removed.
    pub fn get(&self, key: &MarketFingerprint) -> Option<CacheHit<V>> {
        let mut inner = self.lock();
        let ttl = self.ttl;
        let Some(expired) = inner
            .entries
            .get(key)
            .map(|e| e.created_at.elapsed() >= ttl)
        else {
            inner.stats.misses += 1;
            return None;
        };
        if expired {
            inner.entries.remove(key);
            inner.order.retain(|k| k != key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            inner.stats.size = inner.entries.len();
            return None;
        }
        inner.stats.hits += 1;
        let entry = inner.entries.get_mut(key)?;
        entry.hits += 1;
        Some(CacheHit {
            value: entry.value.clone(),
            hits: entry.hits,
            age: entry.created_at.elapsed(),
        })
    }

    /// Store a value. Re-inserting a key refreshes it and moves it to the
    /// back of the eviction order.
    pub fn insert(&self, key: MarketFingerprint, value: V) {
        let mut inner = self.lock();
        if inner.entries.contains_key(&key) {
            inner.order.retain(|k| k != &key);
        }
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                created_at: Instant::now(),
                hits: 0,
            },
        );
        inner.order.push_back(key);
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.remove(&oldest).is_some() {
                inner.stats.evictions += 1;
            }
        }
        inner.stats.size = inner.entries.len();
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.lock();
        let ttl = self.ttl;
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.created_at.elapsed() < ttl);
        let removed = before - inner.entries.len();
        if removed > 0 {
            let CacheInner { entries, order, .. } = &mut *inner;
            order.retain(|k| entries.contains_key(k));
        }
        inner.stats.expirations += removed as u64;
        inner.stats.size = inner.entries.len();
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.stats.size = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(price: f64, volume: f64) -> MarketSnapshot {
        MarketSnapshot {
            price,
            volume,
            volatility: 0.01,
            trend: Trend::Bullish,
            support: None,
            resistance: None,
        }
    }

    fn key(symbol: &str, price: f64) -> MarketFingerprint {
        MarketFingerprint::new(symbol, &snapshot(price, 1_000.0), CacheMode::Ensemble)
    }

    #[test]
    fn test_fingerprint_is_coarse() {
        let a = MarketFingerprint::new("btc", &snapshot(42_110.0, 1_234.0), CacheMode::Ensemble);
        let b = MarketFingerprint::new("BTC", &snapshot(42_140.0, 1_190.0), CacheMode::Ensemble);
        assert_eq!(a, b);

        let moved = MarketFingerprint::new("BTC", &snapshot(42_600.0, 1_234.0), CacheMode::Ensemble);
        assert_ne!(a, moved);

        let single = MarketFingerprint::new("BTC", &snapshot(42_110.0, 1_234.0), CacheMode::Single);
        assert_ne!(a, single);
        assert!(a.key().starts_with("BTC:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_then_expire() {
        let cache = DecisionCache::new(Duration::from_secs(60), 10);
        cache.insert(key("BTC", 100.0), "buy");

        let hit = cache.get(&key("BTC", 100.0)).unwrap();
        assert_eq!(hit.value, "buy");
        assert_eq!(hit.hits, 1);
        assert_eq!(cache.get(&key("BTC", 100.0)).unwrap().hits, 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get(&key("BTC", 100.0)).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn test_capacity_evicts_oldest_insert() {
        let cache = DecisionCache::new(Duration::from_secs(60), 2);
        cache.insert(key("A", 1.0), 1);
        cache.insert(key("B", 1.0), 2);
        // reading A does not protect it; eviction is by insertion order
        assert!(cache.get(&key("A", 1.0)).is_some());
        cache.insert(key("C", 1.0), 3);

        assert!(cache.get(&key("A", 1.0)).is_none());
        assert!(cache.get(&key("B", 1.0)).is_some());
        assert!(cache.get(&key("C", 1.0)).is_some());
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_reinsert_refreshes_position() {
        let cache = DecisionCache::new(Duration::from_secs(60), 2);
        cache.insert(key("A", 1.0), 1);
        cache.insert(key("B", 1.0), 2);
        cache.insert(key("A", 1.0), 10);
        cache.insert(key("C", 1.0), 3);

        assert_eq!(cache.get(&key("A", 1.0)).unwrap().value, 10);
        assert!(cache.get(&key("B", 1.0)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = DecisionCache::new(Duration::from_secs(10), 10);
        cache.insert(key("A", 1.0), 1);
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.insert(key("B", 1.0), 2);
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("B", 1.0)).is_some());
    }
}

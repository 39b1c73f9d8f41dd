//! Key-addressed query result store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::freshness::{CacheEntry, CacheRead};

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that found a usable entry.
    pub hits: u64,
    /// Reads that found nothing (or, for fresh reads, nothing fresh).
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

/// Shared query cache.
///
/// At most one entry per key. Each individual operation is atomic; sequences
/// of operations are not, so two fetches racing on one key resolve as
/// last-write-wins.
#[derive(Debug, Clone, Default)]
pub struct QueryCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    counters: Arc<Counters>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `key` regardless of freshness.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.get(key).map(|e| e.value().clone());
        self.record(entry.is_some());
        entry
    }

    /// Entry for `key` only if it is within `ttl`.
    pub fn get_fresh(&self, key: &str, ttl: Duration) -> Option<CacheEntry> {
        let entry = self
            .entries
            .get(key)
            .filter(|e| e.is_fresh(ttl))
            .map(|e| e.value().clone());
        self.record(entry.is_some());
        entry
    }

    /// Typed read regardless of freshness. A value that no longer decodes as
    /// `T` counts as a miss.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<CacheRead<T>> {
        let read = self.entries.get(key).and_then(|e| e.decode().ok());
        self.record(read.is_some());
        read
    }

    /// Store `value` under `key`, replacing any previous entry and stamping
    /// the current time.
    pub fn set(&self, key: impl Into<String>, value: Value) -> CacheEntry {
        let entry = CacheEntry::new(key, value);
        self.entries.insert(entry.key.clone(), entry.clone());
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        entry
    }

    /// Serialize and store a typed value.
    pub fn set_as<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<CacheEntry, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        Ok(self.set(key, value))
    }

    /// Remove the entry for `key`. Returns whether one existed.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
        }
    }

    fn record(&self, hit: bool) {
        let counter = if hit {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get_returns_value() {
        let cache = QueryCache::new();
        let stored = cache.set("categories", json!(["Beaches"]));
        let entry = cache.get("categories").unwrap();
        assert_eq!(entry.value, json!(["Beaches"]));
        assert_eq!(entry.stored_at, stored.stored_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_overwrites_and_restamps() {
        let cache = QueryCache::new();
        let first = cache.set("k", json!(1));
        tokio::time::advance(Duration::from_secs(10)).await;
        let second = cache.set("k", json!(2));

        assert!(second.stored_at > first.stored_at);
        assert_eq!(cache.get("k").unwrap().value, json!(2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_returns_stale_entries() {
        let cache = QueryCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("reviews", json!([]));
        tokio::time::advance(Duration::from_secs(120)).await;

        assert!(cache.get_fresh("reviews", ttl).is_none());
        let entry = cache.get("reviews").unwrap();
        assert!(!entry.is_fresh(ttl));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_scenario_five_minutes() {
        let cache = QueryCache::new();
        let ttl = Duration::from_secs(5 * 60);
        cache.set("loc1", json!({"location_id": 1}));

        tokio::time::advance(Duration::from_secs(4 * 60 + 59)).await;
        assert!(cache.get_fresh("loc1", ttl).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get_fresh("loc1", ttl).is_none());
        assert!(cache.get("loc1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_and_clear() {
        let cache = QueryCache::new();
        cache.set("a", json!(1));
        cache.set("b", json!(2));

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert!(!cache.contains("a"));

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_the_store() {
        let cache = QueryCache::new();
        let other = cache.clone();
        other.set("shared", json!(true));
        assert_eq!(cache.get("shared").unwrap().value, json!(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_growth_is_unbounded() {
        let cache = QueryCache::new();
        for i in 0..1_000 {
            cache.set(format!("key-{i}"), json!(i));
        }
        assert_eq!(cache.len(), 1_000);
        assert_eq!(cache.stats().entry_count, 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_track_hits_and_misses() {
        let cache = QueryCache::new();
        cache.set("k", json!(1));
        cache.get("k");
        cache.get("missing");
        cache.delete("k");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.deletes, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 0.001);
        assert!((CacheStats::default().hit_rate() - 0.0).abs() < 0.001);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_as_round_trips_typed_value() {
        let cache = QueryCache::new();
        cache.set_as("ids", &vec![3_u32, 1, 2]).unwrap();
        let read = cache.get("ids").unwrap().decode::<Vec<u32>>().unwrap();
        assert_eq!(read.into_value(), vec![3, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_as_mismatch_counts_as_miss() {
        let cache = QueryCache::new();
        cache.set("name", json!("Marari"));
        assert_eq!(cache.get_as::<String>("name").unwrap().value(), "Marari");
        assert!(cache.get_as::<u64>("name").is_none());
        assert_eq!(cache.stats().misses, 1);
    }
}

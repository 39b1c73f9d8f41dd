//! Freshness judgement for cached entries.
//!
//! Entries carry the monotonic instant they were stored at; callers supply
//! the time-to-live. Stale entries are never dropped here.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of comparing an entry's age against a time-to-live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `now - stored_at <= ttl`.
    Fresh,
    /// Older than the time-to-live; only usable as a degraded fallback.
    Stale,
}

impl Freshness {
    pub fn is_fresh(self) -> bool {
        matches!(self, Self::Fresh)
    }

    pub fn is_stale(self) -> bool {
        matches!(self, Self::Stale)
    }
}

/// A stored query result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    /// Monotonic store time, used for every freshness decision.
    pub stored_at: Instant,
    /// Wall-clock store time, for display only.
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            stored_at: Instant::now(),
            cached_at: Utc::now(),
        }
    }

    /// Time elapsed since the entry was stored.
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.stored_at)
    }

    pub fn freshness(&self, ttl: Duration) -> Freshness {
        if self.age() <= ttl {
            Freshness::Fresh
        } else {
            Freshness::Stale
        }
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.freshness(ttl).is_fresh()
    }

    /// Decode the stored JSON into a typed read.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<CacheRead<T>, serde_json::Error> {
        let value = serde_json::from_value(self.value.clone())?;
        Ok(CacheRead {
            value,
            stored_at: self.stored_at,
            cached_at: self.cached_at,
        })
    }
}

/// Typed view of a cache entry, carrying its age metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    stored_at: Instant,
    cached_at: DateTime<Utc>,
}

impl<T> CacheRead<T> {
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.stored_at)
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() <= ttl
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            stored_at: self.stored_at,
            cached_at: self.cached_at,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

//! In-process query cache with explicit freshness.
//!
//! Results are stored under opaque string keys. The cache never decides on
//! its own whether an entry is usable: readers judge freshness against their
//! own time-to-live, and stale entries stay available as a fallback when a
//! refresh fails.
//!
//! # Lifecycle
//!
//! A [`QueryCache`] is constructed explicitly and handed to whoever needs it.
//! Clones share the same store. There is no eviction beyond `delete`/`clear`,
//! so the store grows with the number of distinct keys.
//!
//! # Example
//!
//! ```ignore
//! let cache = QueryCache::new();
//! cache.set("reviews", json!([...]));
//!
//! match cache.get("reviews") {
//!     Some(entry) if entry.is_fresh(ttl) => use_it(entry.value),
//!     Some(entry) => show_stale_then_refresh(entry.value),
//!     None => fetch(),
//! }
//! ```

pub mod freshness;
pub mod query_cache;

pub use freshness::{CacheEntry, CacheRead, Freshness};
pub use query_cache::{CacheStats, QueryCache};

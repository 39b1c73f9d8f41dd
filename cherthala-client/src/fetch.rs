//! Cached request lifecycle for a single query key.
//!
//! ```text
//! idle ──load──▶ loading ──▶ success
//!                   │
//!                   └──────▶ error (+ stale data when cached)
//! ```
//!
//! `refetch` drops the cache entry and goes round again. Every run carries a
//! generation number; a result whose generation is no longer current (the
//! key changed, a newer run started, or the handle was unmounted) is not
//! published.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cherthala_core::{BackendError, CherthalaError};
use cherthala_storage::QueryCache;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::resilience::with_deadline;

/// Produces a fresh backend call for each run.
pub type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, BackendError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// What a consumer renders.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchState<T> {
    pub status: FetchStatus,
    pub data: Option<T>,
    pub error: Option<CherthalaError>,
}

impl<T> Default for FetchState<T> {
    fn default() -> Self {
        Self {
            status: FetchStatus::Idle,
            data: None,
            error: None,
        }
    }
}

impl<T> FetchState<T> {
    pub fn is_loading(&self) -> bool {
        self.status == FetchStatus::Loading
    }

    /// Error shown next to previously fetched data.
    pub fn is_stale_while_error(&self) -> bool {
        self.status == FetchStatus::Error && self.data.is_some()
    }

    /// Short message for the error indicator, if any.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(CherthalaError::user_message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// When false the handle stays idle and never calls the backend.
    pub enabled: bool,
    pub timeout: Duration,
    /// How long a cached result counts as fresh.
    pub cache_time: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(5),
            cache_time: Duration::from_secs(5 * 60),
        }
    }
}

struct Slot<T> {
    key: String,
    fetcher: Fetcher<T>,
    generation: u64,
    mounted: bool,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    state: watch::Sender<FetchState<T>>,
}

/// Handle driving one cached query. Clones share the same state.
pub struct QueryHandle<T> {
    cache: QueryCache,
    options: FetchOptions,
    shared: Arc<Shared<T>>,
}

impl<T> Clone for QueryHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            options: self.options.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> QueryHandle<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        cache: QueryCache,
        key: impl Into<String>,
        fetcher: Fetcher<T>,
        options: FetchOptions,
    ) -> Self {
        let (state, _) = watch::channel(FetchState::default());
        Self {
            cache,
            options,
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    key: key.into(),
                    fetcher,
                    generation: 0,
                    mounted: true,
                }),
                state,
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot<T>> {
        self.shared.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> String {
        self.slot().key.clone()
    }

    pub fn snapshot(&self) -> FetchState<T> {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FetchState<T>> {
        self.shared.state.subscribe()
    }

    /// Run the lifecycle once and return the resulting state.
    pub async fn load(&self) -> FetchState<T> {
        if !self.options.enabled {
            return self.snapshot();
        }
        let (key, fetcher, generation) = {
            let mut slot = self.slot();
            if !slot.mounted {
                return self.snapshot();
            }
            slot.generation += 1;
            (slot.key.clone(), Arc::clone(&slot.fetcher), slot.generation)
        };

        self.publish(generation, |state| {
            state.status = FetchStatus::Loading;
            state.error = None;
        });

        if let Some(entry) = self.cache.get_fresh(&key, self.options.cache_time) {
            match entry.decode::<T>() {
                Ok(read) => {
                    self.publish(generation, |state| {
                        state.status = FetchStatus::Success;
                        state.data = Some(read.into_value());
                    });
                    return self.snapshot();
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "Discarding undecodable cache entry");
                }
            }
        }

        match with_deadline(&key, self.options.timeout, fetcher()).await {
            Ok(data) => {
                if let Err(err) = self.cache.set_as(key.as_str(), &data) {
                    tracing::warn!(key = %key, error = %err, "Failed to cache query result");
                }
                self.publish(generation, |state| {
                    state.status = FetchStatus::Success;
                    state.data = Some(data);
                });
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "Query error");
                let cached = self.cache.get_as::<T>(&key).map(|read| read.into_value());
                self.publish(generation, |state| {
                    state.status = FetchStatus::Error;
                    state.error = Some(err);
                    if cached.is_some() {
                        state.data = cached;
                    }
                });
            }
        }
        self.snapshot()
    }

    /// Drop the cached entry and run again.
    pub async fn refetch(&self) -> FetchState<T> {
        let key = self.key();
        self.cache.delete(&key);
        self.load().await
    }

    /// Point the handle at a new key. Any in-flight run for the old key is
    /// orphaned and its result will not be published.
    pub async fn set_key(&self, key: impl Into<String>, fetcher: Fetcher<T>) -> FetchState<T> {
        {
            let mut slot = self.slot();
            slot.key = key.into();
            slot.fetcher = fetcher;
            slot.generation += 1;
            self.shared.state.send_replace(FetchState::default());
        }
        self.load().await
    }

    /// Stop publishing. In-flight runs finish but are ignored.
    pub fn unmount(&self) {
        let mut slot = self.slot();
        slot.mounted = false;
        slot.generation += 1;
    }

    pub fn is_mounted(&self) -> bool {
        self.slot().mounted
    }

    /// Apply `update` if `generation` is still current. The check and the
    /// send happen under the slot lock.
    fn publish(&self, generation: u64, update: impl FnOnce(&mut FetchState<T>)) -> bool {
        let slot = self.slot();
        if !slot.mounted || slot.generation != generation {
            tracing::debug!(key = %slot.key, generation, "Discarding stale query result");
            return false;
        }
        self.shared.state.send_modify(update);
        true
    }
}

/// Box a closure returning a backend future as a [`Fetcher`].
pub fn fetcher<T, F, Fut>(f: F) -> Fetcher<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<T, BackendError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

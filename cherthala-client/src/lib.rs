//! Cherthala Client - Resilient Data Access for the Directory
//!
//! Wraps backend calls with deadlines, retries and fallbacks, runs settled
//! batches, caches query results with stale-while-error reads, and owns the
//! authentication state machine. [`RestBackend`] talks to the hosted
//! PostgREST/GoTrue endpoints; tests use the in-memory mock from
//! `cherthala-storage` through the same traits.

pub mod api_client;
pub mod auth;
pub mod batch;
pub mod config;
pub mod directory;
pub mod error;
pub mod fetch;
pub mod resilience;
pub mod telemetry;

use std::sync::Arc;

use cherthala_core::ClientConfig;
use cherthala_storage::QueryCache;

pub use api_client::{ApiClientError, RestBackend};
pub use auth::{AuthController, AuthState, AuthSubscription};
pub use batch::{batch_queries, BatchQuery, BatchReport};
pub use config::{ConfigError, FileConfig};
pub use directory::{Directory, LocationFormOptions, ReviewFormOptions};
pub use error::{ClientError, ClientResult};
pub use fetch::{fetcher, FetchOptions, FetchState, FetchStatus, Fetcher, QueryHandle};
pub use resilience::{
    handle_backend_error, optimized_query, with_deadline, QueryOptions, QueryOutcome,
};
pub use telemetry::{init_tracing, TelemetryConfig};

/// One backend connection with its shared cache and timing policy.
#[derive(Debug, Clone)]
pub struct Cherthala {
    backend: Arc<RestBackend>,
    cache: QueryCache,
    config: ClientConfig,
}

impl Cherthala {
    pub fn from_file_config(file: &FileConfig) -> ClientResult<Self> {
        file.validate()?;
        let backend = RestBackend::from_config(file)?;
        Ok(Self {
            backend: Arc::new(backend),
            cache: QueryCache::new(),
            config: file.client_config(),
        })
    }

    /// Load configuration from `--config` or `CHERTHALA_CONFIG`.
    pub fn load() -> ClientResult<Self> {
        let file = FileConfig::load()?;
        Self::from_file_config(&file)
    }

    pub fn backend(&self) -> &Arc<RestBackend> {
        &self.backend
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Start the auth controller and resume any stored session.
    pub async fn start_auth(&self) -> AuthController {
        AuthController::start(
            self.backend.clone(),
            self.backend.clone(),
            self.config.auth.clone(),
        )
        .await
    }

    /// Directory operations bound to this connection's cache.
    pub fn directory(&self) -> Directory {
        Directory::new(self.backend.clone(), self.cache.clone(), self.config.clone())
    }
}

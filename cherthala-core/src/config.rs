//! Timing policy for the data layer.
//!
//! Every deadline and retry knob lives here with the defaults the directory
//! app has always shipped with. Nothing is hard-coded in the helpers.

use crate::error::ConfigError;
use std::time::Duration;

/// Deadline and retry policy for a single resilient query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    pub timeout: Duration,
    /// Additional attempts after the first one.
    pub retries: u32,
    /// Fixed delay between attempts (not exponential).
    pub retry_backoff: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 1,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Overall deadline for a settled batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
        }
    }
}

/// Query cache freshness window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Per-operation deadlines of the auth controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTimeouts {
    pub session_resume: Duration,
    pub profile_fetch: Duration,
    pub sign_up: Duration,
    pub sign_in: Duration,
    pub sign_out: Duration,
    pub profile_update: Duration,
}

impl Default for AuthTimeouts {
    fn default() -> Self {
        Self {
            session_resume: Duration::from_secs(5),
            profile_fetch: Duration::from_secs(3),
            sign_up: Duration::from_secs(10),
            sign_in: Duration::from_secs(8),
            sign_out: Duration::from_secs(5),
            profile_update: Duration::from_secs(5),
        }
    }
}

/// Aggregate client configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientConfig {
    pub query: QueryConfig,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
    pub auth: AuthTimeouts,
}

impl ClientConfig {
    /// Validate the configuration.
    ///
    /// Every deadline must be non-zero; a zero deadline would fail every call.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let deadlines = [
            ("query.timeout", self.query.timeout),
            ("batch.timeout", self.batch.timeout),
            ("cache.ttl", self.cache.ttl),
            ("auth.session_resume", self.auth.session_resume),
            ("auth.profile_fetch", self.auth.profile_fetch),
            ("auth.sign_up", self.auth.sign_up),
            ("auth.sign_in", self.auth.sign_in),
            ("auth.sign_out", self.auth.sign_out),
            ("auth.profile_update", self.auth.profile_update),
        ];
        for (field, value) in deadlines {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "must be > 0".to_string(),
                });
            }
        }
        Ok(())
    }
}

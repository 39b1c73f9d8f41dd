//! Configuration loading for the Cherthala client.
//!
//! Connection fields are required. Timing sections are optional and overlay
//! the shipped defaults of [`ClientConfig`].

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cherthala_core::ClientConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub backend_url: String,
    pub anon_key: String,
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub query: QuerySection,
    #[serde(default)]
    pub batch: BatchSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub auth: AuthSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuerySection {
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchSection {
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSection {
    pub session_resume_ms: Option<u64>,
    pub profile_fetch_ms: Option<u64>,
    pub sign_up_ms: Option<u64>,
    pub sign_in_ms: Option<u64>,
    pub sign_out_ms: Option<u64>,
    pub profile_update_ms: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or CHERTHALA_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl From<cherthala_core::ConfigError> for ConfigError {
    fn from(err: cherthala_core::ConfigError) -> Self {
        match err {
            cherthala_core::ConfigError::MissingRequired { field } => Self::InvalidValue {
                field,
                reason: "is required".to_string(),
            },
            cherthala_core::ConfigError::InvalidValue { field, reason } => {
                Self::InvalidValue { field, reason }
            }
        }
    }
}

fn overlay(target: &mut Duration, millis: Option<u64>) {
    if let Some(ms) = millis {
        *target = Duration::from_millis(ms);
    }
}

impl FileConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.backend_url.trim();
        if url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "backend_url".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                field: "backend_url".to_string(),
                reason: "must start with http:// or https://".to_string(),
            });
        }
        if self.anon_key.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "anon_key".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        self.client_config().validate()?;
        Ok(())
    }

    /// Timing policy with this file's overrides applied.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::default();
        overlay(&mut config.query.timeout, self.query.timeout_ms);
        if let Some(retries) = self.query.retries {
            config.query.retries = retries;
        }
        overlay(&mut config.query.retry_backoff, self.query.retry_backoff_ms);
        overlay(&mut config.batch.timeout, self.batch.timeout_ms);
        overlay(&mut config.cache.ttl, self.cache.ttl_ms);
        overlay(&mut config.auth.session_resume, self.auth.session_resume_ms);
        overlay(&mut config.auth.profile_fetch, self.auth.profile_fetch_ms);
        overlay(&mut config.auth.sign_up, self.auth.sign_up_ms);
        overlay(&mut config.auth.sign_in, self.auth.sign_in_ms);
        overlay(&mut config.auth.sign_out, self.auth.sign_out_ms);
        overlay(&mut config.auth.profile_update, self.auth.profile_update_ms);
        config
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("CHERTHALA_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

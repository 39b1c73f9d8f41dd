//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::error::ClientError;

/// Logging configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, e.g. `"info"` or `"cherthala_client=debug"`.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: std::env::var("CHERTHALA_LOG").unwrap_or_else(|_| "info".to_string()),
            json: std::env::var("CHERTHALA_LOG_FORMAT")
                .map(|s| s.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }
}

/// Install the global fmt subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed, so calling
/// this more than once is harmless.
pub fn init_tracing(config: &TelemetryConfig) -> Result<bool, ClientError> {
    let filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| ClientError::Telemetry(format!("invalid log filter: {}", e)))?;

    let installed = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    };
    Ok(installed.is_ok())
}

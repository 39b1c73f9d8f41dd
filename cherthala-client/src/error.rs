//! Error types for client setup.
//!
//! Data operations report [`cherthala_core::CherthalaError`]; this type only
//! covers configuration, transport construction and logging setup.

use thiserror::Error;

use crate::api_client::ApiClientError;
use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Api(#[from] ApiClientError),

    #[error("Telemetry setup failed: {0}")]
    Telemetry(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

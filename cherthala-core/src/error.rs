//! Error types for Cherthala operations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Backend code denoting "no row found" for single-row selects.
pub const NOT_FOUND_CODE: &str = "PGRST116";

const TIMEOUT_MESSAGE: &str = "Request timed out. Please try again.";
const NOT_FOUND_MESSAGE: &str = "No data found.";
const GENERIC_MESSAGE: &str = "Something went wrong.";

/// Error payload returned by the hosted backend.
///
/// Mirrors the `{ code, message }` shape of the backend's error objects; the
/// HTTP status is kept when the error came over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackendError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(skip)]
    pub status: Option<u16>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            status: None,
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            status: None,
        }
    }

    /// The "no row found" error a single-row select produces on zero rows.
    pub fn not_found() -> Self {
        Self::with_code(
            NOT_FOUND_CODE,
            "JSON object requested, multiple (or no) rows returned",
        )
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.code.as_deref() == Some(NOT_FOUND_CODE)
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for BackendError {}

/// Form validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ValidationError {
    pub fn required(field: impl Into<String>) -> Self {
        Self::RequiredFieldMissing {
            field: field.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Master error type for the data layer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CherthalaError {
    #[error("Operation '{operation}' timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("No data found")]
    NotFound,

    #[error("Backend error: {0}")]
    Backend(BackendError),

    #[error("No user logged in")]
    NotAuthenticated,

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CherthalaError {
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Classify a raw backend error. `PGRST116` becomes [`CherthalaError::NotFound`].
    pub fn classify(err: BackendError) -> Self {
        if err.is_not_found() {
            Self::NotFound
        } else {
            Self::Backend(err)
        }
    }

    /// True for deadline failures, including backend errors that report a timeout
    /// in their message.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Backend(err) => err.message.to_ascii_lowercase().contains("timeout"),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Short message suitable for showing next to (possibly stale) data.
    pub fn user_message(&self) -> String {
        if self.is_timeout() {
            return TIMEOUT_MESSAGE.to_string();
        }
        match self {
            Self::NotFound => NOT_FOUND_MESSAGE.to_string(),
            Self::Backend(err) if err.message.trim().is_empty() => GENERIC_MESSAGE.to_string(),
            Self::Backend(err) => err.message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for CherthalaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<BackendError> for CherthalaError {
    fn from(err: BackendError) -> Self {
        Self::classify(err)
    }
}

/// Result type alias for Cherthala operations.
pub type CherthalaResult<T> = Result<T, CherthalaError>;

// =============================================================================
// TESTS
// =============================================================================

//! Cherthala Core - Entity Types and Backend Contracts
//!
//! Pure data structures and collaborator traits. All other crates depend on this.
//! Nothing in here performs I/O; the backend traits are implemented elsewhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod backend;
pub mod config;
pub mod entities;
pub mod error;

pub use backend::{
    AuthBackend, AuthChange, AuthChangeEvent, AuthResponse, Filter, Order, TableBackend,
    TableQuery,
};
pub use config::{AuthTimeouts, BatchConfig, CacheConfig, ClientConfig, QueryConfig};
pub use entities::{
    Category, DirectoryUser, HomeOverview, Location, NewCategory, NewLocation, NewReview,
    NewUser, Review, SelectOption, SiteStats,
};
pub use error::{
    BackendError, CherthalaError, CherthalaResult, ConfigError, ValidationError,
    NOT_FOUND_CODE,
};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Identifier of an authenticated account. Profiles reuse it as their primary key.
pub type UserId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Table names exposed by the directory backend.
pub mod tables {
    pub const USERS: &str = "users";
    pub const CATEGORIES: &str = "categories";
    pub const LOCATIONS: &str = "locations";
    pub const REVIEWS: &str = "reviews";
}

// ============================================================================
// SESSION & PROFILE
// ============================================================================

/// Account record as returned by the auth service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
    /// Free-form metadata attached at sign-up (full name, hometown).
    #[serde(default)]
    pub user_metadata: serde_json::Value,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
}

/// An established session. Tokens are opaque to this crate.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds at which the access token expires.
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: AuthUser,
}

impl Session {
    pub fn user_id(&self) -> UserId {
        self.user.id
    }

    pub fn email(&self) -> Option<&str> {
        self.user.email.as_deref()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"[redacted]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[redacted]"))
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

/// Row of the `users` table belonging to an authenticated account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub hometown: Option<String>,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
}

/// Partial profile update. Absent fields are left untouched by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hometown: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none() && self.email.is_none() && self.hometown.is_none()
    }
}

/// Email/password pair for password sign-in.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// Sign-up payload. Full name and hometown travel as account metadata and
/// are also written to the profile row afterwards.
#[derive(Debug, Clone)]
pub struct SignUpRequest {
    pub credentials: Credentials,
    pub full_name: String,
    pub hometown: String,
}

impl SignUpRequest {
    pub fn new(
        email: impl Into<String>,
        password: impl Into<String>,
        full_name: impl Into<String>,
        hometown: impl Into<String>,
    ) -> Self {
        Self {
            credentials: Credentials::new(email, password),
            full_name: full_name.into(),
            hometown: hometown.into(),
        }
    }

    /// Metadata object sent alongside the credentials.
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "full_name": self.full_name,
            "hometown": self.hometown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> AuthUser {
        AuthUser {
            id: Uuid::nil(),
            email: Some("anu@example.com".to_string()),
            user_metadata: serde_json::Value::Null,
            created_at: None,
        }
    }

    #[test]
    fn test_session_debug_redacts_tokens() {
        let session = Session {
            access_token: "secret-access".to_string(),
            refresh_token: Some("secret-refresh".to_string()),
            expires_at: Some(42),
            user: user(),
        };
        let rendered = format!("{:?}", session);
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));
        assert!(rendered.contains("anu@example.com"));
        assert_eq!(session.email(), Some("anu@example.com"));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("a@b.c", "hunter2");
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn test_profile_update_serializes_only_present_fields() {
        let update = ProfileUpdate {
            hometown: Some("Cherthala".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json, serde_json::json!({ "hometown": "Cherthala" }));
        assert!(!update.is_empty());
        assert!(ProfileUpdate::default().is_empty());
    }

    #[test]
    fn test_profile_deserializes_with_missing_optionals() {
        let profile: Profile =
            serde_json::from_value(serde_json::json!({ "id": Uuid::nil() })).unwrap();
        assert_eq!(profile.full_name, None);
        assert_eq!(profile.hometown, None);
    }

    #[test]
    fn test_sign_up_metadata() {
        let req = SignUpRequest::new("a@b.c", "pw", "Anu", "Cherthala");
        assert_eq!(req.metadata()["full_name"], "Anu");
        assert_eq!(req.metadata()["hometown"], "Cherthala");
    }
}

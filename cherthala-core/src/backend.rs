//! Collaborator traits for the hosted backend.
//!
//! The backend is opaque: an auth service and a table service reached over
//! HTTP. These traits are the only surface the data layer depends on, so the
//! REST client and the in-memory mock are interchangeable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::BackendError;
use crate::{AuthUser, Credentials, Session, SignUpRequest};

/// Kind of auth state change pushed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthChangeEvent {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// An auth state change notification carrying the session after the change.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthChange {
    pub event: AuthChangeEvent,
    pub session: Option<Session>,
}

impl AuthChange {
    pub fn new(event: AuthChangeEvent, session: Option<Session>) -> Self {
        Self { event, session }
    }
}

/// Result of sign-up or sign-in.
///
/// Sign-up may create the account without a session (confirmation pending),
/// so both halves are optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthResponse {
    pub user: Option<AuthUser>,
    pub session: Option<Session>,
}

/// Auth half of the backend.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Resume a previously established session, if any.
    async fn get_session(&self) -> Result<Option<Session>, BackendError>;

    async fn sign_up(&self, request: &SignUpRequest) -> Result<AuthResponse, BackendError>;

    async fn sign_in_with_password(
        &self,
        credentials: &Credentials,
    ) -> Result<AuthResponse, BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    /// Subscribe to auth state changes. Dropping the receiver unsubscribes.
    fn subscribe_auth_changes(&self) -> broadcast::Receiver<AuthChange>;
}

/// Equality filter on a column.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: Value,
}

/// Sort clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// Table-style query: `from(table).select(..).eq(..).order(..).limit(..)`.
#[derive(Debug, Clone, PartialEq)]
pub struct TableQuery {
    pub table: String,
    pub columns: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl TableQuery {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: "*".to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.columns = columns.into();
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a row satisfies every equality filter.
    pub fn matches(&self, row: &Value) -> bool {
        self.filters
            .iter()
            .all(|filter| row.get(&filter.column) == Some(&filter.value))
    }
}

/// Table half of the backend. Rows travel as JSON objects.
#[async_trait]
pub trait TableBackend: Send + Sync {
    async fn select(&self, query: &TableQuery) -> Result<Vec<Value>, BackendError>;

    /// Exactly one row; zero rows yield the `PGRST116` not-found error.
    async fn select_single(&self, query: &TableQuery) -> Result<Value, BackendError>;

    async fn count(&self, table: &str) -> Result<u64, BackendError>;

    /// Insert rows and return them as stored.
    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, BackendError>;

    /// Apply a partial update to matching rows and return them as stored.
    async fn update(&self, query: &TableQuery, patch: Value) -> Result<Vec<Value>, BackendError>;

    /// Delete matching rows, returning how many were removed.
    async fn delete(&self, query: &TableQuery) -> Result<u64, BackendError>;
}

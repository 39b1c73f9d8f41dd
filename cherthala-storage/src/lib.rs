//! Cherthala Storage - Query Cache and Mock Backend
//!
//! The query cache owned by the client data layer, and an in-memory
//! implementation of the backend traits used by tests and offline demos.

pub mod cache;

pub use cache::{CacheEntry, CacheRead, CacheStats, Freshness, QueryCache};

use async_trait::async_trait;
use cherthala_core::{
    tables, AuthBackend, AuthChange, AuthChangeEvent, AuthResponse, AuthUser, BackendError,
    Credentials, Session, SignUpRequest, TableBackend, TableQuery,
};
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// MOCK BACKEND
// ============================================================================

/// Backend operation, used to target latency and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    GetSession,
    SignUp,
    SignIn,
    SignOut,
    Select,
    SelectSingle,
    Count,
    Insert,
    Update,
    Delete,
}

#[derive(Debug)]
struct Account {
    password: String,
    user: AuthUser,
}

#[derive(Debug, Default)]
struct MockState {
    tables: HashMap<String, Vec<Value>>,
    accounts: HashMap<String, Account>,
    session: Option<Session>,
    next_id: i64,
    latency: HashMap<MockOp, Duration>,
    faults: HashMap<MockOp, VecDeque<BackendError>>,
    broken_tables: HashMap<String, BackendError>,
    calls: HashMap<MockOp, usize>,
    auto_confirm: bool,
}

#[derive(Debug)]
struct MockInner {
    state: Mutex<MockState>,
    auth_tx: broadcast::Sender<AuthChange>,
}

/// In-memory backend with injectable latency and failures.
///
/// Clones share state, so a test can keep a handle while the code under test
/// owns another.
#[derive(Debug, Clone)]
pub struct MockBackend {
    inner: Arc<MockInner>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Create an empty backend. Sign-ups are confirmed immediately.
    pub fn new() -> Self {
        let (auth_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(MockInner {
                state: Mutex::new(MockState {
                    next_id: 1,
                    auto_confirm: true,
                    ..Default::default()
                }),
                auth_tx,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed rows into a table without going through `insert`.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        let mut state = self.state();
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// Register an account that can sign in.
    pub fn add_account(&self, email: &str, password: &str) -> AuthUser {
        let user = AuthUser {
            id: Uuid::new_v4(),
            email: Some(email.to_string()),
            user_metadata: Value::Null,
            created_at: Some(Utc::now()),
        };
        self.state().accounts.insert(
            email.to_string(),
            Account {
                password: password.to_string(),
                user: user.clone(),
            },
        );
        user
    }

    /// Set the session that `get_session` resumes.
    pub fn set_session(&self, session: Option<Session>) {
        self.state().session = session;
    }

    pub fn current_session(&self) -> Option<Session> {
        self.state().session.clone()
    }

    /// When false, sign-up creates the account but returns no session.
    pub fn set_auto_confirm(&self, auto_confirm: bool) {
        self.state().auto_confirm = auto_confirm;
    }

    pub fn set_latency(&self, op: MockOp, latency: Duration) {
        self.state().latency.insert(op, latency);
    }

    /// Fail the next call of `op` with `err`. Queued faults fire in order.
    pub fn fail_next(&self, op: MockOp, err: BackendError) {
        self.state().faults.entry(op).or_default().push_back(err);
    }

    /// Fail every table operation on `table` until [`MockBackend::heal_table`].
    pub fn break_table(&self, table: &str, err: BackendError) {
        self.state().broken_tables.insert(table.to_string(), err);
    }

    pub fn heal_table(&self, table: &str) {
        self.state().broken_tables.remove(table);
    }

    /// Number of calls made for `op`, including failed ones.
    pub fn calls(&self, op: MockOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.state().tables.get(table).cloned().unwrap_or_default()
    }

    /// Push an auth change as if it came from another tab or a token refresh.
    pub fn emit_auth_change(&self, change: AuthChange) {
        if change.event == AuthChangeEvent::SignedOut {
            self.state().session = None;
        } else if change.session.is_some() {
            self.state().session = change.session.clone();
        }
        let _ = self.inner.auth_tx.send(change);
    }

    /// Live subscribers to the auth change channel.
    pub fn auth_subscriber_count(&self) -> usize {
        self.inner.auth_tx.receiver_count()
    }

    /// Count the call, sleep for the configured latency and surface any
    /// injected fault.
    async fn enter(&self, op: MockOp, table: Option<&str>) -> Result<(), BackendError> {
        let latency = {
            let mut state = self.state();
            *state.calls.entry(op).or_insert(0) += 1;
            state.latency.get(&op).copied()
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if let Some(err) = state.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            tracing::debug!(?op, error = %err, "Injected fault");
            return Err(err);
        }
        if let Some(err) = table.and_then(|t| state.broken_tables.get(t)) {
            tracing::debug!(?op, table, error = %err, "Table unavailable");
            return Err(err.clone());
        }
        Ok(())
    }

    fn open_session(&self, user: AuthUser) -> Session {
        let session = Session {
            access_token: format!("mock-access-{}", Uuid::new_v4()),
            refresh_token: Some(format!("mock-refresh-{}", Uuid::new_v4())),
            expires_at: Some(Utc::now().timestamp() + 3600),
            user,
        };
        self.state().session = Some(session.clone());
        let _ = self.inner.auth_tx.send(AuthChange::new(
            AuthChangeEvent::SignedIn,
            Some(session.clone()),
        ));
        session
    }

    fn prepare_row(state: &mut MockState, table: &str, row: Value) -> Value {
        let mut object = match row {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let now = Value::String(Utc::now().to_rfc3339());
        let (id_column, stamp_column) = match table {
            tables::CATEGORIES => (Some("category_id"), None),
            tables::LOCATIONS => (Some("location_id"), Some("date_added")),
            tables::REVIEWS => (Some("review_id"), Some("review_date")),
            tables::USERS => (None, Some("created_at")),
            _ => (None, None),
        };
        if let Some(column) = id_column {
            if object.get(column).map_or(true, Value::is_null) {
                object.insert(column.to_string(), Value::from(state.next_id));
                state.next_id += 1;
            }
        }
        if let Some(column) = stamp_column {
            if object.get(column).map_or(true, Value::is_null) {
                object.insert(column.to_string(), now);
            }
        }
        Value::Object(object)
    }
}

fn sort_rows(rows: &mut [Value], query: &TableQuery) {
    if let Some(order) = &query.order {
        rows.sort_by(|a, b| {
            let left = a.get(&order.column).map(sort_key).unwrap_or_default();
            let right = b.get(&order.column).map(sort_key).unwrap_or_default();
            let ordering = left.cmp(&right);
            if order.ascending {
                ordering
            } else {
                ordering.reverse()
            }
        });
    }
}

/// Sort key that orders numbers numerically and everything else textually.
fn sort_key(value: &Value) -> (u8, i64, String) {
    match value {
        Value::Null => (0, 0, String::new()),
        Value::Number(n) => (1, n.as_i64().unwrap_or_default(), String::new()),
        Value::String(s) => (2, 0, s.clone()),
        other => (3, 0, other.to_string()),
    }
}

#[async_trait]
impl AuthBackend for MockBackend {
    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        self.enter(MockOp::GetSession, None).await?;
        Ok(self.state().session.clone())
    }

    async fn sign_up(&self, request: &SignUpRequest) -> Result<AuthResponse, BackendError> {
        self.enter(MockOp::SignUp, None).await?;
        let email = request.credentials.email.clone();
        let (user, auto_confirm) = {
            let mut state = self.state();
            if state.accounts.contains_key(&email) {
                return Err(BackendError::with_code("user_already_exists", "User already registered")
                    .with_status(422));
            }
            let user = AuthUser {
                id: Uuid::new_v4(),
                email: Some(email.clone()),
                user_metadata: request.metadata(),
                created_at: Some(Utc::now()),
            };
            state.accounts.insert(
                email,
                Account {
                    password: request.credentials.password.clone(),
                    user: user.clone(),
                },
            );
            (user, state.auto_confirm)
        };

        let session = auto_confirm.then(|| self.open_session(user.clone()));
        Ok(AuthResponse {
            user: Some(user),
            session,
        })
    }

    async fn sign_in_with_password(
        &self,
        credentials: &Credentials,
    ) -> Result<AuthResponse, BackendError> {
        self.enter(MockOp::SignIn, None).await?;
        let user = {
            let state = self.state();
            match state.accounts.get(&credentials.email) {
                Some(account) if account.password == credentials.password => account.user.clone(),
                _ => {
                    return Err(BackendError::with_code(
                        "invalid_credentials",
                        "Invalid login credentials",
                    )
                    .with_status(400))
                }
            }
        };
        let session = self.open_session(user.clone());
        Ok(AuthResponse {
            user: Some(user),
            session: Some(session),
        })
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        self.enter(MockOp::SignOut, None).await?;
        self.state().session = None;
        let _ = self
            .inner
            .auth_tx
            .send(AuthChange::new(AuthChangeEvent::SignedOut, None));
        Ok(())
    }

    fn subscribe_auth_changes(&self) -> broadcast::Receiver<AuthChange> {
        self.inner.auth_tx.subscribe()
    }
}

#[async_trait]
impl TableBackend for MockBackend {
    async fn select(&self, query: &TableQuery) -> Result<Vec<Value>, BackendError> {
        self.enter(MockOp::Select, Some(&query.table)).await?;
        let state = self.state();
        let mut rows: Vec<Value> = state
            .tables
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();
        sort_rows(&mut rows, query);
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn select_single(&self, query: &TableQuery) -> Result<Value, BackendError> {
        self.enter(MockOp::SelectSingle, Some(&query.table)).await?;
        let state = self.state();
        let mut matching = state
            .tables
            .get(&query.table)
            .into_iter()
            .flatten()
            .filter(|r| query.matches(r));
        match (matching.next(), matching.next()) {
            (Some(row), None) => Ok(row.clone()),
            _ => Err(BackendError::not_found().with_status(406)),
        }
    }

    async fn count(&self, table: &str) -> Result<u64, BackendError> {
        self.enter(MockOp::Count, Some(table)).await?;
        Ok(self.state().tables.get(table).map_or(0, |rows| rows.len() as u64))
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, BackendError> {
        self.enter(MockOp::Insert, Some(table)).await?;
        let mut state = self.state();
        let prepared: Vec<Value> = rows
            .into_iter()
            .map(|row| Self::prepare_row(&mut state, table, row))
            .collect();
        if table == tables::USERS {
            let existing = state.tables.get(table).map(Vec::as_slice).unwrap_or_default();
            for (index, row) in prepared.iter().enumerate() {
                let id = row.get("id");
                if existing.iter().chain(&prepared[..index]).any(|r| r.get("id") == id) {
                    return Err(BackendError::with_code(
                        "23505",
                        "duplicate key value violates unique constraint \"users_pkey\"",
                    )
                    .with_status(409));
                }
            }
        }
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(prepared.iter().cloned());
        Ok(prepared)
    }

    async fn update(&self, query: &TableQuery, patch: Value) -> Result<Vec<Value>, BackendError> {
        self.enter(MockOp::Update, Some(&query.table)).await?;
        let Value::Object(patch) = patch else {
            return Err(BackendError::new("update payload must be an object").with_status(400));
        };
        let mut state = self.state();
        let mut updated = Vec::new();
        if let Some(rows) = state.tables.get_mut(&query.table) {
            for row in rows.iter_mut().filter(|r| query.matches(r)) {
                if let Some(object) = row.as_object_mut() {
                    for (column, value) in &patch {
                        object.insert(column.clone(), value.clone());
                    }
                }
                updated.push(row.clone());
            }
        }
        Ok(updated)
    }

    async fn delete(&self, query: &TableQuery) -> Result<u64, BackendError> {
        self.enter(MockOp::Delete, Some(&query.table)).await?;
        let mut state = self.state();
        let Some(rows) = state.tables.get_mut(&query.table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !query.matches(r));
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_assigns_ids_and_timestamps() {
        let backend = MockBackend::new();
        let rows = backend
            .insert(tables::CATEGORIES, vec![json!({"category_name": "Beaches"})])
            .await
            .unwrap();
        assert_eq!(rows[0]["category_id"], json!(1));

        let rows = backend
            .insert(tables::REVIEWS, vec![json!({"rating": 5})])
            .await
            .unwrap();
        assert_eq!(rows[0]["review_id"], json!(2));
        assert!(rows[0]["review_date"].is_string());
    }

    #[tokio::test]
    async fn test_select_filters_orders_and_limits() {
        let backend = MockBackend::new();
        backend.seed(
            tables::REVIEWS,
            vec![
                json!({"review_id": 1, "rating": 5, "review_date": "2024-01-01"}),
                json!({"review_id": 2, "rating": 3, "review_date": "2024-02-01"}),
                json!({"review_id": 3, "rating": 5, "review_date": "2024-03-01"}),
            ],
        );

        let query = TableQuery::from(tables::REVIEWS)
            .eq("rating", 5)
            .order("review_date", false)
            .limit(1);
        let rows = backend.select(&query).await.unwrap();
        assert_eq!(rows, vec![json!({"review_id": 3, "rating": 5, "review_date": "2024-03-01"})]);
    }

    #[tokio::test]
    async fn test_select_single_zero_rows_is_not_found() {
        let backend = MockBackend::new();
        let err = backend
            .select_single(&TableQuery::from(tables::USERS).eq("id", "nobody"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_returns_stored_rows() {
        let backend = MockBackend::new();
        backend.seed(tables::USERS, vec![json!({"id": "u1", "full_name": "Anu"})]);
        let rows = backend
            .update(
                &TableQuery::from(tables::USERS).eq("id", "u1"),
                json!({"hometown": "Cherthala"}),
            )
            .await
            .unwrap();
        assert_eq!(rows[0]["full_name"], "Anu");
        assert_eq!(rows[0]["hometown"], "Cherthala");
    }

    #[tokio::test]
    async fn test_delete_counts_removed_rows() {
        let backend = MockBackend::new();
        backend.seed(tables::CATEGORIES, vec![json!({"category_id": 1}), json!({"category_id": 2})]);
        let removed = backend
            .delete(&TableQuery::from(tables::CATEGORIES).eq("category_id", 1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(backend.count(tables::CATEGORIES).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_user_id_rejected() {
        let backend = MockBackend::new();
        backend.seed(tables::USERS, vec![json!({"id": "u1"})]);
        let err = backend
            .insert(tables::USERS, vec![json!({"id": "u1"})])
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("23505"));
    }

    #[tokio::test]
    async fn test_duplicate_user_id_within_batch_rejected() {
        let backend = MockBackend::new();
        let err = backend
            .insert(tables::USERS, vec![json!({"id": "u2"}), json!({"id": "u2"})])
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("23505"));
        assert_eq!(err.status, Some(409));
        assert!(backend.rows(tables::USERS).is_empty());
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let backend = MockBackend::new();
        backend.fail_next(MockOp::Count, BackendError::new("boom"));
        assert!(backend.count(tables::USERS).await.is_err());
        assert!(backend.count(tables::USERS).await.is_ok());
        assert_eq!(backend.calls(MockOp::Count), 2);
    }

    #[tokio::test]
    async fn test_broken_table_fails_until_healed() {
        let backend = MockBackend::new();
        backend.break_table(tables::LOCATIONS, BackendError::new("relation unavailable"));
        assert!(backend.select(&TableQuery::from(tables::LOCATIONS)).await.is_err());
        assert!(backend.select(&TableQuery::from(tables::USERS)).await.is_ok());
        backend.heal_table(tables::LOCATIONS);
        assert!(backend.select(&TableQuery::from(tables::LOCATIONS)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_virtual_time() {
        let backend = MockBackend::new();
        backend.set_latency(MockOp::GetSession, Duration::from_secs(30));
        let started = tokio::time::Instant::now();
        backend.get_session().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_sign_in_emits_signed_in_and_sign_out_clears() {
        let backend = MockBackend::new();
        backend.add_account("anu@example.com", "secret");
        let mut changes = backend.subscribe_auth_changes();

        let response = backend
            .sign_in_with_password(&Credentials::new("anu@example.com", "secret"))
            .await
            .unwrap();
        assert!(response.session.is_some());
        assert_eq!(changes.recv().await.unwrap().event, AuthChangeEvent::SignedIn);

        backend.sign_out().await.unwrap();
        assert_eq!(changes.recv().await.unwrap().event, AuthChangeEvent::SignedOut);
        assert!(backend.get_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let backend = MockBackend::new();
        backend.add_account("anu@example.com", "secret");
        let err = backend
            .sign_in_with_password(&Credentials::new("anu@example.com", "nope"))
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(400));
    }

    #[tokio::test]
    async fn test_sign_up_without_auto_confirm_has_no_session() {
        let backend = MockBackend::new();
        backend.set_auto_confirm(false);
        let response = backend
            .sign_up(&SignUpRequest::new("new@example.com", "pw", "New", "Cherthala"))
            .await
            .unwrap();
        assert!(response.user.is_some());
        assert!(response.session.is_none());
        assert!(backend
            .sign_up(&SignUpRequest::new("new@example.com", "pw", "New", "Cherthala"))
            .await
            .is_err());
    }
}

//! HTTP backend: auth and table endpoints of the hosted service.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use cherthala_core::{
    AuthBackend, AuthChange, AuthChangeEvent, AuthResponse, AuthUser, BackendError, Credentials,
    Session, SignUpRequest, TableBackend, TableQuery,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_RANGE};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::config::FileConfig;

const APIKEY: &str = "apikey";
const PREFER: &str = "prefer";
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";
const RETURN_REPRESENTATION: &str = "return=representation";
const COUNT_EXACT: &str = "count=exact";

#[derive(Debug, thiserror::Error)]
pub enum ApiClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Config error: {0}")]
    Config(String),
}

/// Token grant as returned by sign-in and confirmed sign-up.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let expires_at = self.expires_at.or_else(|| {
            self.expires_in
                .map(|secs| chrono::Utc::now().timestamp() + secs)
        });
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

/// Error body of either the auth or the table service.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl ErrorBody {
    fn into_backend_error(self, status: StatusCode) -> BackendError {
        let code = match self.code {
            Some(Value::String(code)) => Some(code),
            _ => None,
        }
        .or(self.error_code)
        .or_else(|| self.error.clone());
        let message = self
            .message
            .or(self.msg)
            .or(self.error_description)
            .or(self.error)
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        BackendError {
            code,
            message,
            status: Some(status.as_u16()),
        }
    }
}

/// Backend reached over HTTP.
///
/// The session lives in memory only; auth changes made through this client
/// are announced on its own broadcast channel.
#[derive(Clone)]
pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    anon_key: String,
    session: Arc<RwLock<Option<Session>>>,
    auth_tx: broadcast::Sender<AuthChange>,
}

impl std::fmt::Debug for RestBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBackend")
            .field("base_url", &self.base_url)
            .field("anon_key", &"[redacted]")
            .finish()
    }
}

impl RestBackend {
    pub fn new(
        base_url: &str,
        anon_key: &str,
        request_timeout: Duration,
    ) -> Result<Self, ApiClientError> {
        if HeaderValue::from_str(anon_key).is_err() {
            return Err(ApiClientError::Config(
                "anon_key is not a valid header value".to_string(),
            ));
        }
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        let (auth_tx, _) = broadcast::channel(32);
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            session: Arc::new(RwLock::new(None)),
            auth_tx,
        })
    }

    pub fn from_config(config: &FileConfig) -> Result<Self, ApiClientError> {
        Self::new(
            &config.backend_url,
            &config.anon_key,
            Duration::from_millis(config.request_timeout_ms),
        )
    }

    /// Install a session obtained elsewhere, e.g. restored from disk.
    pub fn restore_session(&self, session: Option<Session>) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session;
    }

    pub fn session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: AuthChangeEvent, session: Option<Session>) {
        let _ = self.auth_tx.send(AuthChange::new(event, session));
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&self.anon_key) {
            headers.insert(HeaderName::from_static(APIKEY), value);
        }
        let token = self
            .session()
            .map(|s| s.access_token)
            .unwrap_or_else(|| self.anon_key.clone());
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client.request(method, url).headers(self.headers())
    }

    fn table_request(&self, method: Method, query: &TableQuery) -> RequestBuilder {
        self.request(method, &format!("/rest/v1/{}", query.table))
            .query(&query_params(query))
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.map_err(transport_error)?;
        let body = serde_json::from_str::<ErrorBody>(&text).unwrap_or_else(|_| ErrorBody {
            message: (!text.trim().is_empty()).then(|| text.clone()),
            ..ErrorBody::default()
        });
        Err(body.into_backend_error(status))
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = self.send(request).await?;
        response.json::<T>().await.map_err(transport_error)
    }
}

/// PostgREST query parameters for `query`.
fn query_params(query: &TableQuery) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), query.columns.replace(char::is_whitespace, ""))];
    for filter in &query.filters {
        let value = match &filter.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        params.push((filter.column.clone(), format!("eq.{}", value)));
    }
    if let Some(order) = &query.order {
        let direction = if order.ascending { "asc" } else { "desc" };
        params.push(("order".to_string(), format!("{}.{}", order.column, direction)));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

fn transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::with_code("timeout", format!("Request timeout: {}", err))
    } else if err.is_decode() {
        BackendError::with_code("decode", err.to_string())
    } else {
        BackendError::new(err.to_string())
    }
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`.
fn parse_content_range(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[async_trait]
impl AuthBackend for RestBackend {
    /// Revalidate the in-memory session against the auth service. A rejected
    /// token clears the session.
    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        let Some(mut session) = self.session() else {
            return Ok(None);
        };
        let request = self.request(Method::GET, "/auth/v1/user");
        match self.send_json::<AuthUser>(request).await {
            Ok(user) => {
                session.user = user;
                self.restore_session(Some(session.clone()));
                Ok(Some(session))
            }
            Err(err) if err.status == Some(401) => {
                tracing::debug!(error = %err, "Stored session rejected");
                self.restore_session(None);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn sign_up(&self, request: &SignUpRequest) -> Result<AuthResponse, BackendError> {
        let body = json!({
            "email": request.credentials.email,
            "password": request.credentials.password,
            "data": request.metadata(),
        });
        let value: Value = self
            .send_json(self.request(Method::POST, "/auth/v1/signup").json(&body))
            .await?;

        if value.get("access_token").is_some() {
            let token: TokenResponse = serde_json::from_value(value)
                .map_err(|e| BackendError::with_code("decode", e.to_string()))?;
            let session = token.into_session();
            self.restore_session(Some(session.clone()));
            self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
            return Ok(AuthResponse {
                user: Some(session.user.clone()),
                session: Some(session),
            });
        }

        // Confirmation pending: the body is the bare user.
        let user: AuthUser = serde_json::from_value(value)
            .map_err(|e| BackendError::with_code("decode", e.to_string()))?;
        Ok(AuthResponse {
            user: Some(user),
            session: None,
        })
    }

    async fn sign_in_with_password(
        &self,
        credentials: &Credentials,
    ) -> Result<AuthResponse, BackendError> {
        let body = json!({
            "email": credentials.email,
            "password": credentials.password,
        });
        let request = self
            .request(Method::POST, "/auth/v1/token")
            .query(&[("grant_type", "password")])
            .json(&body);
        let token: TokenResponse = self.send_json(request).await?;
        let session = token.into_session();
        self.restore_session(Some(session.clone()));
        self.emit(AuthChangeEvent::SignedIn, Some(session.clone()));
        Ok(AuthResponse {
            user: Some(session.user.clone()),
            session: Some(session),
        })
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        if self.session().is_some() {
            self.send(self.request(Method::POST, "/auth/v1/logout")).await?;
        }
        self.restore_session(None);
        self.emit(AuthChangeEvent::SignedOut, None);
        Ok(())
    }

    fn subscribe_auth_changes(&self) -> broadcast::Receiver<AuthChange> {
        self.auth_tx.subscribe()
    }
}

#[async_trait]
impl TableBackend for RestBackend {
    async fn select(&self, query: &TableQuery) -> Result<Vec<Value>, BackendError> {
        self.send_json(self.table_request(Method::GET, query)).await
    }

    async fn select_single(&self, query: &TableQuery) -> Result<Value, BackendError> {
        let request = self
            .table_request(Method::GET, query)
            .header(ACCEPT, SINGLE_OBJECT);
        self.send_json(request).await
    }

    async fn count(&self, table: &str) -> Result<u64, BackendError> {
        let request = self
            .request(Method::HEAD, &format!("/rest/v1/{}", table))
            .query(&[("select", "*")])
            .header(PREFER, COUNT_EXACT);
        let response = self.send(request).await?;
        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .ok_or_else(|| BackendError::new("Missing or invalid Content-Range header"))
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, BackendError> {
        let request = self
            .request(Method::POST, &format!("/rest/v1/{}", table))
            .header(PREFER, RETURN_REPRESENTATION)
            .json(&rows);
        self.send_json(request).await
    }

    async fn update(&self, query: &TableQuery, patch: Value) -> Result<Vec<Value>, BackendError> {
        let request = self
            .table_request(Method::PATCH, query)
            .header(PREFER, RETURN_REPRESENTATION)
            .json(&patch);
        self.send_json(request).await
    }

    async fn delete(&self, query: &TableQuery) -> Result<u64, BackendError> {
        let request = self
            .table_request(Method::DELETE, query)
            .header(PREFER, RETURN_REPRESENTATION);
        let removed: Vec<Value> = self.send_json(request).await?;
        Ok(removed.len() as u64)
    }
}

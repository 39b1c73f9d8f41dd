//! Session and profile state for the signed-in user.
//!
//! ```text
//! Initializing ──resume ok──▶ Authenticated { profile: None } ──profile──▶ Authenticated { profile: Some }
//!      │
//!      └──timeout / error / no session──▶ Unauthenticated
//! ```
//!
//! The controller is the single writer of [`AuthState`]. Consumers get
//! snapshots through [`AuthSubscription`]. Backend notifications are
//! handled by a listener task that runs until [`AuthController::shutdown`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cherthala_core::{
    tables, AuthBackend, AuthChange, AuthResponse, AuthTimeouts, AuthUser, CherthalaError,
    CherthalaResult, Credentials, Profile, ProfileUpdate, SignUpRequest, TableBackend,
    TableQuery, UserId, ValidationError,
};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};

use crate::resilience::with_deadline;

const PROFILE_COLUMNS: &str = "id, full_name, email, hometown, created_at";

/// Authentication state published to consumers.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AuthState {
    /// Session resume has not settled yet.
    #[default]
    Initializing,
    Unauthenticated,
    /// `profile` stays `None` until the profile fetch succeeds, and for good
    /// if it fails.
    Authenticated {
        user: AuthUser,
        profile: Option<Profile>,
    },
}

impl AuthState {
    pub fn user(&self) -> Option<&AuthUser> {
        match self {
            Self::Authenticated { user, .. } => Some(user),
            _ => None,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user().map(|u| u.id)
    }

    pub fn profile(&self) -> Option<&Profile> {
        match self {
            Self::Authenticated { profile, .. } => profile.as_ref(),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    pub fn is_initializing(&self) -> bool {
        matches!(self, Self::Initializing)
    }
}

/// Read-only view of the controller's state.
#[derive(Debug)]
pub struct AuthSubscription {
    rx: Option<watch::Receiver<AuthState>>,
}

impl AuthSubscription {
    /// Latest state. After `unsubscribe` this is always `Unauthenticated`.
    pub fn current(&self) -> AuthState {
        self.rx
            .as_ref()
            .map(|rx| rx.borrow().clone())
            .unwrap_or(AuthState::Unauthenticated)
    }

    pub fn current_user_id(&self) -> Option<UserId> {
        self.rx.as_ref().and_then(|rx| rx.borrow().user_id())
    }

    /// Wait for the next change. Returns false once unsubscribed or when the
    /// controller is gone.
    pub async fn changed(&mut self) -> bool {
        match self.rx.as_mut() {
            Some(rx) => rx.changed().await.is_ok(),
            None => false,
        }
    }

    /// Wait until `predicate` holds for the current state.
    pub async fn wait_for(&mut self, predicate: impl FnMut(&AuthState) -> bool) -> Option<AuthState> {
        let rx = self.rx.as_mut()?;
        rx.wait_for(predicate).await.ok().map(|state| state.clone())
    }

    /// Stop receiving updates. Idempotent.
    pub fn unsubscribe(&mut self) {
        self.rx = None;
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }
}

impl Clone for AuthSubscription {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

struct Inner {
    auth: Arc<dyn AuthBackend>,
    tables: Arc<dyn TableBackend>,
    timeouts: AuthTimeouts,
    state: watch::Sender<AuthState>,
    alive: AtomicBool,
    profile_tasks: Mutex<Vec<AbortHandle>>,
}

impl Inner {
    fn snapshot(&self) -> AuthState {
        self.state.borrow().clone()
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<AbortHandle>> {
        self.profile_tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `update` unless the controller has been shut down.
    fn update(&self, update: impl FnOnce(&mut AuthState)) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        self.state.send_modify(update);
    }

    /// Derive the state from a session (or its absence) and kick off the
    /// profile fetch for a signed-in user.
    fn apply_session(self: &Arc<Self>, user: Option<AuthUser>) {
        match user {
            Some(user) => {
                let user_id = user.id;
                self.update(|state| {
                    let profile = state
                        .profile()
                        .filter(|p| p.id == user_id)
                        .cloned();
                    *state = AuthState::Authenticated { user, profile };
                });
                self.spawn_profile_fetch(user_id);
            }
            None => self.update(|state| *state = AuthState::Unauthenticated),
        }
    }

    fn on_auth_change(self: &Arc<Self>, change: AuthChange) {
        tracing::debug!(event = ?change.event, "Auth state changed");
        self.apply_session(change.session.map(|s| s.user));
    }

    async fn resume(self: &Arc<Self>) {
        let result = with_deadline(
            "session resume",
            self.timeouts.session_resume,
            self.auth.get_session(),
        )
        .await;
        match result {
            Ok(Some(session)) => self.apply_session(Some(session.user)),
            Ok(None) => self.settle_unauthenticated(),
            Err(err) => {
                tracing::warn!(error = %err, "Session resume failed");
                self.settle_unauthenticated();
            }
        }
    }

    /// Leave `Initializing` without clobbering a session that a notification
    /// established while the resume was in flight.
    fn settle_unauthenticated(&self) {
        self.update(|state| {
            if state.is_initializing() {
                *state = AuthState::Unauthenticated;
            }
        });
    }

    fn spawn_profile_fetch(self: &Arc<Self>, user_id: UserId) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _ = inner.fetch_profile(user_id).await;
        });
        let mut tasks = self.tasks();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle.abort_handle());
    }

    async fn fetch_profile(&self, user_id: UserId) -> CherthalaResult<Option<Profile>> {
        let query = TableQuery::from(tables::USERS)
            .select(PROFILE_COLUMNS)
            .eq("id", user_id.to_string());
        let result = with_deadline(
            "profile fetch",
            self.timeouts.profile_fetch,
            self.tables.select_single(&query),
        )
        .await
        .and_then(|row| Ok(serde_json::from_value::<Profile>(row)?));

        match result {
            Ok(profile) => {
                self.set_profile(user_id, Some(profile.clone()));
                Ok(Some(profile))
            }
            Err(CherthalaError::NotFound) => {
                self.set_profile(user_id, None);
                Ok(None)
            }
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "Error fetching profile");
                self.set_profile(user_id, None);
                Err(err)
            }
        }
    }

    /// Store `profile` only if `user_id` is still the signed-in user.
    fn set_profile(&self, user_id: UserId, profile: Option<Profile>) {
        self.update(|state| {
            if let AuthState::Authenticated { user, profile: slot } = state {
                if user.id == user_id {
                    *slot = profile;
                }
            }
        });
    }
}

/// Owns the authenticated identity and profile.
pub struct AuthController {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl AuthController {
    /// Subscribe to backend notifications, then resume any existing session.
    ///
    /// Returns once the state has left `Initializing`; the profile may still
    /// be loading.
    pub async fn start(
        auth: Arc<dyn AuthBackend>,
        tables: Arc<dyn TableBackend>,
        timeouts: AuthTimeouts,
    ) -> Self {
        let changes = auth.subscribe_auth_changes();
        let (state, _) = watch::channel(AuthState::Initializing);
        let inner = Arc::new(Inner {
            auth,
            tables,
            timeouts,
            state,
            alive: AtomicBool::new(true),
            profile_tasks: Mutex::new(Vec::new()),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(listen(Arc::clone(&inner), changes, shutdown_rx));

        inner.resume().await;

        Self {
            inner,
            shutdown_tx,
            listener: Mutex::new(Some(listener)),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> AuthState {
        self.inner.snapshot()
    }

    pub fn subscribe(&self) -> AuthSubscription {
        AuthSubscription {
            rx: Some(self.inner.state.subscribe()),
        }
    }

    /// Create an account. A failed profile-row insert afterwards is logged
    /// and does not fail the sign-up.
    pub async fn sign_up(&self, request: SignUpRequest) -> CherthalaResult<AuthResponse> {
        let timeout = self.inner.timeouts.sign_up;
        let response = with_deadline("sign up", timeout, self.inner.auth.sign_up(&request)).await?;

        if let Some(user) = &response.user {
            let row = json!({
                "id": user.id,
                "full_name": request.full_name,
                "email": request.credentials.email,
                "hometown": request.hometown,
            });
            let insert = self.inner.tables.insert(tables::USERS, vec![row]);
            match with_deadline("profile insert", timeout, insert).await {
                Ok(_) => {
                    if self.inner.snapshot().user_id() == Some(user.id) {
                        self.inner.spawn_profile_fetch(user.id);
                    }
                }
                Err(err) => {
                    tracing::warn!(user_id = %user.id, error = %err, "Error creating profile");
                }
            }
        }

        if let Some(session) = &response.session {
            self.inner.apply_session(Some(session.user.clone()));
        }
        Ok(response)
    }

    pub async fn sign_in(&self, credentials: Credentials) -> CherthalaResult<AuthResponse> {
        let response = with_deadline(
            "sign in",
            self.inner.timeouts.sign_in,
            self.inner.auth.sign_in_with_password(&credentials),
        )
        .await?;
        if let Some(session) = &response.session {
            self.inner.apply_session(Some(session.user.clone()));
        }
        Ok(response)
    }

    /// End the session and clear the profile.
    pub async fn sign_out(&self) -> CherthalaResult<()> {
        with_deadline("sign out", self.inner.timeouts.sign_out, self.inner.auth.sign_out()).await?;
        self.inner.apply_session(None);
        Ok(())
    }

    /// Patch the signed-in user's profile row and adopt the row the backend
    /// returns.
    pub async fn update_profile(&self, update: ProfileUpdate) -> CherthalaResult<Profile> {
        let user_id = self
            .inner
            .snapshot()
            .user_id()
            .ok_or(CherthalaError::NotAuthenticated)?;
        if update.is_empty() {
            return Err(ValidationError::invalid("update", "no fields to update").into());
        }

        let query = TableQuery::from(tables::USERS).eq("id", user_id.to_string());
        let patch = serde_json::to_value(&update)?;
        let rows = with_deadline(
            "profile update",
            self.inner.timeouts.profile_update,
            self.inner.tables.update(&query, patch),
        )
        .await?;
        let row = rows.into_iter().next().ok_or(CherthalaError::NotFound)?;
        let profile: Profile = serde_json::from_value(row)?;

        self.inner.set_profile(user_id, Some(profile.clone()));
        Ok(profile)
    }

    /// Fetch the profile for `user_id` and store it if that user is still
    /// signed in. A missing row is `Ok(None)`.
    pub async fn fetch_profile(&self, user_id: UserId) -> CherthalaResult<Option<Profile>> {
        self.inner.fetch_profile(user_id).await
    }

    /// Release the backend subscription and stop applying updates. Only the
    /// first call does anything; returns whether this call did.
    pub fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.alive.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }
        for task in self.inner.tasks().drain(..) {
            task.abort();
        }
        tracing::debug!("Auth controller shut down");
        true
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for AuthController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn listen(
    inner: Arc<Inner>,
    mut changes: broadcast::Receiver<AuthChange>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            change = changes.recv() => match change {
                Ok(change) => {
                    if !inner.alive.load(Ordering::Acquire) {
                        break;
                    }
                    inner.on_auth_change(change);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Auth listener lagged behind notifications");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

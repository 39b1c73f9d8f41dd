//! Auth controller lifecycle against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use cherthala_client::{AuthController, AuthState, AuthSubscription};
use cherthala_core::{
    AuthChange, AuthChangeEvent, AuthTimeouts, AuthUser, BackendError, Credentials,
    ProfileUpdate, SignUpRequest,
};
use cherthala_test_utils::assertions::{
    assert_backend_error, assert_not_authenticated, assert_timeout, assert_validation_error,
};
use cherthala_test_utils::{fixtures, tables, MockBackend, MockOp};

async fn start(backend: &MockBackend) -> AuthController {
    AuthController::start(
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        AuthTimeouts::default(),
    )
    .await
}

/// Wait (on virtual time) until `predicate` holds.
async fn settle(
    subscription: &mut AuthSubscription,
    predicate: impl FnMut(&AuthState) -> bool,
) -> AuthState {
    tokio::time::timeout(Duration::from_secs(30), subscription.wait_for(predicate))
        .await
        .expect("auth state did not settle")
        .expect("subscription closed")
}

async fn drain_tasks() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// SESSION RESUME
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_resume_without_session_is_unauthenticated() {
    let backend = MockBackend::new();
    let controller = start(&backend).await;
    assert_eq!(controller.state(), AuthState::Unauthenticated);
}

#[tokio::test(start_paused = true)]
async fn test_resume_timeout_settles_unauthenticated() {
    let (backend, _, _) = fixtures::signed_in_backend("anu@example.com");
    backend.set_latency(MockOp::GetSession, Duration::from_secs(30));

    let started = tokio::time::Instant::now();
    let controller = start(&backend).await;

    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert_eq!(controller.state(), AuthState::Unauthenticated);
}

#[tokio::test(start_paused = true)]
async fn test_resume_error_settles_unauthenticated() {
    let backend = MockBackend::new();
    backend.fail_next(MockOp::GetSession, BackendError::new("network down"));
    let controller = start(&backend).await;
    assert_eq!(controller.state(), AuthState::Unauthenticated);
}

#[tokio::test(start_paused = true)]
async fn test_resume_with_session_loads_profile() {
    let (backend, session, profile) = fixtures::signed_in_backend("anu@example.com");
    let controller = start(&backend).await;

    let state = controller.state();
    assert!(state.is_authenticated());
    assert_eq!(state.user_id(), Some(session.user_id()));

    let mut subscription = controller.subscribe();
    let state = settle(&mut subscription, |s| s.profile().is_some()).await;
    assert_eq!(state.profile(), Some(&profile));
}

#[tokio::test(start_paused = true)]
async fn test_missing_profile_row_leaves_profile_empty() {
    let backend = MockBackend::new();
    let user = backend.add_account("new@example.com", "password123");
    backend.set_session(Some(fixtures::session_for(&user)));

    let controller = start(&backend).await;
    let profile = controller.fetch_profile(user.id).await;

    assert_eq!(profile, Ok(None));
    assert!(controller.state().is_authenticated());
    assert!(controller.state().profile().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_profile_fetch_failure_clears_profile() {
    let (backend, session, _) = fixtures::signed_in_backend("anu@example.com");
    let controller = start(&backend).await;
    let mut subscription = controller.subscribe();
    settle(&mut subscription, |s| s.profile().is_some()).await;

    backend.break_table(tables::USERS, BackendError::new("permission denied for table users"));
    let result = controller.fetch_profile(session.user_id()).await;

    assert_backend_error(&result, "permission denied");
    assert!(controller.state().is_authenticated());
    assert!(controller.state().profile().is_none());
}

// ============================================================================
// SIGN UP / SIGN IN / SIGN OUT
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_sign_up_creates_profile_row() {
    let backend = MockBackend::new();
    let controller = start(&backend).await;

    let response = controller
        .sign_up(SignUpRequest::new("chinnu@example.com", "secret123", "Chinnu", "Kanichukulangara"))
        .await
        .unwrap();
    let user = response.user.unwrap();

    let rows = backend.rows(tables::USERS);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["full_name"], "Chinnu");
    assert_eq!(rows[0]["hometown"], "Kanichukulangara");

    let mut subscription = controller.subscribe();
    let state = settle(&mut subscription, |s| s.profile().is_some()).await;
    assert_eq!(state.user_id(), Some(user.id));
    assert_eq!(state.profile().and_then(|p| p.full_name.as_deref()), Some("Chinnu"));
}

#[tokio::test(start_paused = true)]
async fn test_sign_up_survives_profile_insert_failure() {
    let backend = MockBackend::new();
    backend.fail_next(MockOp::Insert, BackendError::new("row-level security violation"));
    let controller = start(&backend).await;

    let response = controller
        .sign_up(SignUpRequest::new("dev@example.com", "secret123", "Dev", "Cherthala"))
        .await;

    let response = response.unwrap();
    assert!(response.session.is_some());
    assert!(backend.rows(tables::USERS).is_empty());

    tokio::time::sleep(Duration::from_secs(5)).await;
    let state = controller.state();
    assert!(state.is_authenticated());
    assert!(state.profile().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_sign_up_pending_confirmation_stays_signed_out() {
    let backend = MockBackend::new();
    backend.set_auto_confirm(false);
    let controller = start(&backend).await;

    let response = controller
        .sign_up(SignUpRequest::new("later@example.com", "secret123", "Later", "Cherthala"))
        .await
        .unwrap();

    assert!(response.session.is_none());
    assert_eq!(backend.rows(tables::USERS).len(), 1);
    assert_eq!(controller.state(), AuthState::Unauthenticated);
}

#[tokio::test(start_paused = true)]
async fn test_sign_in_and_sign_out() {
    let (backend, session, profile) = fixtures::signed_in_backend("anu@example.com");
    backend.set_session(None);
    let controller = start(&backend).await;
    assert_eq!(controller.state(), AuthState::Unauthenticated);

    controller
        .sign_in(Credentials::new("anu@example.com", "password123"))
        .await
        .unwrap();
    let mut subscription = controller.subscribe();
    let state = settle(&mut subscription, |s| s.profile().is_some()).await;
    assert_eq!(state.user_id(), Some(session.user_id()));
    assert_eq!(state.profile(), Some(&profile));

    controller.sign_out().await.unwrap();
    assert_eq!(controller.state(), AuthState::Unauthenticated);
    assert!(backend.current_session().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_sign_in_wrong_password_keeps_state() {
    let (backend, _, _) = fixtures::signed_in_backend("anu@example.com");
    backend.set_session(None);
    let controller = start(&backend).await;

    let result = controller
        .sign_in(Credentials::new("anu@example.com", "wrong"))
        .await;

    assert_backend_error(&result, "Invalid login credentials");
    assert_eq!(controller.state(), AuthState::Unauthenticated);
}

#[tokio::test(start_paused = true)]
async fn test_sign_in_times_out() {
    let (backend, _, _) = fixtures::signed_in_backend("anu@example.com");
    backend.set_session(None);
    backend.set_latency(MockOp::SignIn, Duration::from_secs(60));
    let controller = start(&backend).await;

    let result = controller
        .sign_in(Credentials::new("anu@example.com", "password123"))
        .await;

    assert_timeout(&result);
    assert_eq!(controller.state(), AuthState::Unauthenticated);
}

// ============================================================================
// PROFILE UPDATE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_update_profile_requires_session() {
    let backend = MockBackend::new();
    let controller = start(&backend).await;

    let result = controller
        .update_profile(ProfileUpdate {
            hometown: Some("Alappuzha".to_string()),
            ..ProfileUpdate::default()
        })
        .await;

    assert_not_authenticated(&result);
}

#[tokio::test(start_paused = true)]
async fn test_update_profile_adopts_stored_row() {
    let (backend, session, profile) = fixtures::signed_in_backend("anu@example.com");
    let controller = start(&backend).await;

    let updated = controller
        .update_profile(ProfileUpdate {
            hometown: Some("Alappuzha".to_string()),
            ..ProfileUpdate::default()
        })
        .await
        .unwrap();

    assert_eq!(updated.id, session.user_id());
    assert_eq!(updated.hometown.as_deref(), Some("Alappuzha"));
    assert_eq!(updated.full_name, profile.full_name);

    drain_tasks().await;
    assert_eq!(controller.state().profile(), Some(&updated));
    assert_eq!(backend.rows(tables::USERS)[0]["hometown"], "Alappuzha");
}

#[tokio::test(start_paused = true)]
async fn test_empty_profile_update_rejected() {
    let (backend, _, _) = fixtures::signed_in_backend("anu@example.com");
    let controller = start(&backend).await;

    let result = controller.update_profile(ProfileUpdate::default()).await;

    assert_validation_error(&result, "update");
    assert_eq!(backend.calls(MockOp::Update), 0);
}

// ============================================================================
// NOTIFICATIONS AND SHUTDOWN
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_notification_from_another_tab_switches_user() {
    let backend = MockBackend::new();
    let other = fixtures::auth_user("biju@example.com");
    let other_profile = fixtures::profile_for(&other, "Biju Nair", "Alappuzha");
    backend.seed(tables::USERS, vec![fixtures::profile_row(&other_profile)]);
    let controller = start(&backend).await;
    let mut subscription = controller.subscribe();

    backend.emit_auth_change(AuthChange::new(
        AuthChangeEvent::SignedIn,
        Some(fixtures::session_for(&other)),
    ));
    let state = settle(&mut subscription, |s| s.profile().is_some()).await;
    assert_eq!(state.user_id(), Some(other.id));
    assert_eq!(state.profile(), Some(&other_profile));

    backend.emit_auth_change(AuthChange::new(AuthChangeEvent::SignedOut, None));
    let state = settle(&mut subscription, |s| !s.is_authenticated()).await;
    assert_eq!(state, AuthState::Unauthenticated);
}

/// Sign a user in from "another tab" one second after start, while the
/// resume (two seconds of latency) is still pending.
fn sign_in_elsewhere_during_resume(backend: &MockBackend) -> AuthUser {
    let other = fixtures::auth_user("biju@example.com");
    let other_profile = fixtures::profile_for(&other, "Biju Nair", "Alappuzha");
    backend.seed(tables::USERS, vec![fixtures::profile_row(&other_profile)]);
    backend.set_latency(MockOp::GetSession, Duration::from_secs(2));

    let emitter = backend.clone();
    let session = fixtures::session_for(&other);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        emitter.emit_auth_change(AuthChange::new(AuthChangeEvent::SignedIn, Some(session)));
    });
    other
}

#[tokio::test(start_paused = true)]
async fn test_failed_resume_keeps_session_from_notification() {
    let backend = MockBackend::new();
    backend.fail_next(MockOp::GetSession, BackendError::new("network down"));
    let other = sign_in_elsewhere_during_resume(&backend);

    let controller = start(&backend).await;

    let state = controller.state();
    assert!(state.is_authenticated());
    assert_eq!(state.user_id(), Some(other.id));
}

#[tokio::test(start_paused = true)]
async fn test_empty_resume_keeps_session_from_notification() {
    let backend = MockBackend::new();
    let other = sign_in_elsewhere_during_resume(&backend);

    let controller = start(&backend).await;
    let mut subscription = controller.subscribe();

    assert_eq!(controller.state().user_id(), Some(other.id));
    let state = settle(&mut subscription, |s| s.profile().is_some()).await;
    assert_eq!(state.profile().map(|p| p.id), Some(other.id));
}

#[tokio::test(start_paused = true)]
async fn test_profile_for_previous_user_is_dropped() {
    let (backend, session, anu_profile) = fixtures::signed_in_backend("anu@example.com");
    let biju = fixtures::auth_user("biju@example.com");
    let biju_profile = fixtures::profile_for(&biju, "Biju Nair", "Alappuzha");
    backend.seed(tables::USERS, vec![fixtures::profile_row(&biju_profile)]);
    let controller = start(&backend).await;
    let mut subscription = controller.subscribe();
    settle(&mut subscription, |s| s.profile() == Some(&anu_profile)).await;

    backend.emit_auth_change(AuthChange::new(
        AuthChangeEvent::SignedIn,
        Some(fixtures::session_for(&biju)),
    ));
    settle(&mut subscription, |s| s.profile() == Some(&biju_profile)).await;

    let fetched = controller.fetch_profile(session.user_id()).await;

    assert_eq!(fetched, Ok(Some(anu_profile)));
    let state = controller.state();
    assert_eq!(state.user_id(), Some(biju.id));
    assert_eq!(state.profile(), Some(&biju_profile));
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_profile_fetch_loses_to_user_switch() {
    let (backend, session, _) = fixtures::signed_in_backend("anu@example.com");
    let biju = fixtures::auth_user("biju@example.com");
    let biju_profile = fixtures::profile_for(&biju, "Biju Nair", "Alappuzha");
    backend.seed(tables::USERS, vec![fixtures::profile_row(&biju_profile)]);
    backend.set_latency(MockOp::SelectSingle, Duration::from_secs(3));

    let controller = start(&backend).await;
    assert_eq!(controller.state().user_id(), Some(session.user_id()));
    let mut subscription = controller.subscribe();

    backend.emit_auth_change(AuthChange::new(
        AuthChangeEvent::SignedIn,
        Some(fixtures::session_for(&biju)),
    ));
    let state = settle(&mut subscription, |s| s.profile().is_some()).await;
    assert_eq!(state.profile(), Some(&biju_profile));

    tokio::time::advance(Duration::from_secs(5)).await;
    drain_tasks().await;
    let state = controller.state();
    assert_eq!(state.user_id(), Some(biju.id));
    assert_eq!(state.profile(), Some(&biju_profile));
    assert_eq!(backend.calls(MockOp::SelectSingle), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribed_view_reads_signed_out() {
    let (backend, _, _) = fixtures::signed_in_backend("anu@example.com");
    let controller = start(&backend).await;
    let mut subscription = controller.subscribe();
    assert!(subscription.current().is_authenticated());

    subscription.unsubscribe();
    subscription.unsubscribe();

    assert!(!subscription.is_active());
    assert_eq!(subscription.current(), AuthState::Unauthenticated);
    assert!(!subscription.changed().await);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_backend_subscription() {
    let (backend, _, _) = fixtures::signed_in_backend("anu@example.com");
    let controller = start(&backend).await;
    assert_eq!(backend.auth_subscriber_count(), 1);

    assert!(controller.shutdown());
    assert!(!controller.shutdown());
    assert!(controller.is_shut_down());

    drain_tasks().await;
    assert_eq!(backend.auth_subscriber_count(), 0);

    let before = controller.state();
    let stranger = fixtures::auth_user("stranger@example.com");
    backend.emit_auth_change(AuthChange::new(
        AuthChangeEvent::SignedIn,
        Some(fixtures::session_for(&stranger)),
    ));
    drain_tasks().await;
    assert_eq!(controller.state(), before);
}

#[tokio::test(start_paused = true)]
async fn test_drop_releases_backend_subscription() {
    let backend = MockBackend::new();
    let controller = start(&backend).await;
    assert_eq!(backend.auth_subscriber_count(), 1);

    drop(controller);
    drain_tasks().await;
    assert_eq!(backend.auth_subscriber_count(), 0);
}

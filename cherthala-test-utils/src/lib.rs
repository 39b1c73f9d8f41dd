//! Cherthala Test Utilities
//!
//! Shared test infrastructure for the workspace:
//! - Proptest generators for cache keys, rows and backend errors
//! - Fixtures for sessions, profiles and a seeded mock backend
//! - Assertions for the data layer's error taxonomy

// Re-export mock backend from its source crate
pub use cherthala_storage::{MockBackend, MockOp};

pub use cherthala_core::{
    tables, AuthUser, BackendError, CherthalaError, CherthalaResult, Profile, Session,
    Timestamp, UserId,
};

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for data-layer inputs.

    use super::*;
    use proptest::prelude::*;

    /// Generate a random UUID.
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Generate a Timestamp within 2020-2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    /// Cache keys in the shapes the app uses (`reviews`, `location:42`, ...).
    pub fn arb_cache_key() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("users".to_string()),
            Just("categories".to_string()),
            Just("locations".to_string()),
            Just("reviews".to_string()),
            Just("home".to_string()),
            (1u32..10_000).prop_map(|id| format!("location:{id}")),
            "[a-z][a-z0-9_:]{0,24}",
        ]
    }

    /// Small JSON payloads: scalars, arrays and flat objects.
    pub fn arb_json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,16}".prop_map(Value::from),
        ];
        leaf.prop_recursive(2, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z_]{1,8}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    /// Backend errors, roughly a quarter of which are "no row found".
    pub fn arb_backend_error() -> impl Strategy<Value = BackendError> {
        prop_oneof![
            1 => Just(BackendError::not_found()),
            3 => ("[0-9A-Z]{5}", "[a-z ]{1,24}")
                .prop_map(|(code, message)| BackendError::with_code(code, message)),
        ]
    }

    /// Per-operation success/failure pattern for batch tests.
    pub fn arb_outcome_pattern(max_len: usize) -> impl Strategy<Value = Vec<bool>> {
        prop::collection::vec(any::<bool>(), 0..=max_len)
    }

    pub fn arb_rating() -> impl Strategy<Value = i32> {
        1i32..=5
    }

    /// A `categories` row as the backend returns it.
    pub fn arb_category_row() -> impl Strategy<Value = Value> {
        (1i64..100_000, "[A-Z][a-z]{2,12}").prop_map(|(id, name)| {
            json!({ "category_id": id, "category_name": name, "description": null, "icon_url": null })
        })
    }

    /// A `reviews` row as the backend returns it.
    pub fn arb_review_row() -> impl Strategy<Value = Value> {
        (1i64..100_000, arb_rating(), "[a-z ]{1,40}", arb_timestamp()).prop_map(
            |(id, rating, text, date)| {
                json!({
                    "review_id": id,
                    "rating": rating,
                    "review_text": text,
                    "review_date": date.to_rfc3339(),
                })
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made sessions, profiles and seeded backends.

    use super::*;

    pub fn auth_user(email: &str) -> AuthUser {
        AuthUser {
            id: Uuid::new_v4(),
            email: Some(email.to_string()),
            user_metadata: Value::Null,
            created_at: Some(Utc::now()),
        }
    }

    pub fn session_for(user: &AuthUser) -> Session {
        Session {
            access_token: format!("test-access-{}", user.id),
            refresh_token: Some(format!("test-refresh-{}", user.id)),
            expires_at: Some(Utc::now().timestamp() + 3600),
            user: user.clone(),
        }
    }

    pub fn profile_for(user: &AuthUser, full_name: &str, hometown: &str) -> Profile {
        Profile {
            id: user.id,
            full_name: Some(full_name.to_string()),
            email: user.email.clone(),
            hometown: Some(hometown.to_string()),
            created_at: Some(Utc::now()),
        }
    }

    pub fn profile_row(profile: &Profile) -> Value {
        json!({
            "id": profile.id,
            "full_name": profile.full_name,
            "email": profile.email,
            "hometown": profile.hometown,
            "created_at": profile.created_at.map(|t| t.to_rfc3339()),
        })
    }

    /// Backend with an account that already has a live session and profile row.
    pub fn signed_in_backend(email: &str) -> (MockBackend, Session, Profile) {
        let backend = MockBackend::new();
        let user = backend.add_account(email, "password123");
        let session = session_for(&user);
        let profile = profile_for(&user, "Anu Thomas", "Cherthala");
        backend.seed(tables::USERS, vec![profile_row(&profile)]);
        backend.set_session(Some(session.clone()));
        (backend, session, profile)
    }

    /// Backend holding a small directory: two categories, three locations,
    /// three reviews and two members.
    pub fn seeded_directory() -> MockBackend {
        let backend = MockBackend::new();
        let anu = Uuid::new_v4();
        let biju = Uuid::new_v4();
        backend.seed(
            tables::USERS,
            vec![
                json!({"id": anu, "full_name": "Anu Thomas", "email": "anu@example.com", "hometown": "Cherthala", "created_at": "2024-01-01T08:00:00Z"}),
                json!({"id": biju, "full_name": "Biju Nair", "email": "biju@example.com", "hometown": "Alappuzha", "created_at": "2024-02-01T08:00:00Z"}),
            ],
        );
        backend.seed(
            tables::CATEGORIES,
            vec![
                json!({"category_id": 101, "category_name": "Temples", "description": "Places of worship", "icon_url": null}),
                json!({"category_id": 100, "category_name": "Beaches", "description": null, "icon_url": null}),
            ],
        );
        backend.seed(
            tables::LOCATIONS,
            vec![
                json!({"location_id": 200, "location_name": "Arthunkal Beach", "description": "Quiet beach", "category_id": 100, "added_by_id": anu, "date_added": "2024-03-01T10:00:00Z"}),
                json!({"location_id": 201, "location_name": "Marari Beach", "description": "Long beach", "category_id": 100, "added_by_id": biju, "date_added": "2024-04-01T10:00:00Z"}),
                json!({"location_id": 202, "location_name": "Cherthala Temple", "description": "Old temple", "category_id": 101, "added_by_id": anu, "date_added": "2024-02-01T10:00:00Z"}),
            ],
        );
        backend.seed(
            tables::REVIEWS,
            vec![
                json!({"review_id": 300, "location_id": 200, "user_id": anu, "rating": 5, "review_text": "Lovely sunsets", "review_date": "2024-05-01T10:00:00Z"}),
                json!({"review_id": 301, "location_id": 201, "user_id": biju, "rating": 3, "review_text": "Crowded", "review_date": "2024-05-02T10:00:00Z"}),
                json!({"review_id": 302, "location_id": 202, "user_id": biju, "rating": 5, "review_text": "Peaceful", "review_date": "2024-05-03T10:00:00Z"}),
            ],
        );
        backend
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over the data layer's error taxonomy.

    use super::*;

    pub fn assert_timeout<T: std::fmt::Debug>(result: &CherthalaResult<T>) {
        match result {
            Err(err) if err.is_timeout() => {}
            other => panic!("Expected timeout, got {:?}", other),
        }
    }

    pub fn assert_not_found<T: std::fmt::Debug>(result: &CherthalaResult<T>) {
        assert!(
            matches!(result, Err(CherthalaError::NotFound)),
            "Expected NotFound, got {:?}",
            result
        );
    }

    pub fn assert_not_authenticated<T: std::fmt::Debug>(result: &CherthalaResult<T>) {
        assert!(
            matches!(result, Err(CherthalaError::NotAuthenticated)),
            "Expected NotAuthenticated, got {:?}",
            result
        );
    }

    pub fn assert_backend_error<T: std::fmt::Debug>(result: &CherthalaResult<T>, message: &str) {
        match result {
            Err(CherthalaError::Backend(err)) => assert!(
                err.message.contains(message),
                "Backend error '{}' does not mention '{}'",
                err.message,
                message
            ),
            other => panic!("Expected backend error, got {:?}", other),
        }
    }

    pub fn assert_validation_error<T: std::fmt::Debug>(result: &CherthalaResult<T>, field: &str) {
        match result {
            Err(CherthalaError::Validation(err)) => assert!(
                err.to_string().contains(field),
                "Validation error '{}' does not mention '{}'",
                err,
                field
            ),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }
}

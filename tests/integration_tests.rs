use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Local, TimeZone};
use serde_json::{json, Value};
use tower::ServiceExt;

use invtrack::api::{create_router, AppState, Metrics, RetryConfig};
use invtrack::contracts::{
    year_prefix, GenerationFailure, OrderNumber, OrderNumberGenerator, RecordStore,
};
use invtrack::storage::{default_staff, seed_users, RocksDbStorage};
use invtrack::tracker::{Tracker, TrackerConfig};

/// Counter whose lock can never be acquired.
struct LockedCounter;

impl OrderNumberGenerator for LockedCounter {
    fn next_order_number_at<Tz: TimeZone>(
        &self,
        _now: DateTime<Tz>,
    ) -> Result<OrderNumber, GenerationFailure> {
        Err(GenerationFailure::LockTimeout(
            "counter:order held by another writer".into(),
        ))
    }

    fn current_sequence(&self) -> Result<u64, GenerationFailure> {
        Ok(0)
    }
}

/// Counter that holds its row lock for a second before issuing number 1.
#[derive(Default)]
struct SlowCounter {
    entered_at: OnceLock<Instant>,
}

impl OrderNumberGenerator for SlowCounter {
    fn next_order_number_at<Tz: TimeZone>(
        &self,
        now: DateTime<Tz>,
    ) -> Result<OrderNumber, GenerationFailure> {
        let _ = self.entered_at.set(Instant::now());
        std::thread::sleep(Duration::from_secs(1));
        Ok(OrderNumber::issued_at(1, now))
    }

    fn current_sequence(&self) -> Result<u64, GenerationFailure> {
        Ok(0)
    }
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        initial_delay_ms: 1,
        max_delay_ms: 5,
    }
}

fn seeded_storage() -> (Arc<RocksDbStorage>, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = RocksDbStorage::open(dir.path()).unwrap();
    seed_users(&storage, &default_staff()).unwrap();
    (Arc::new(storage), dir)
}

fn create_test_app() -> (Router, tempfile::TempDir) {
    let (storage, dir) = seeded_storage();
    let orders = Arc::new(storage.order_counter());
    let tracker = Tracker::new(storage, orders, TrackerConfig::default());
    let state = Arc::new(AppState::new(tracker, Arc::new(Metrics::new()), fast_retry()));
    (create_router(state), dir)
}

fn create_test_app_with_locked_counter() -> (Router, Arc<RocksDbStorage>, tempfile::TempDir) {
    let (storage, dir) = seeded_storage();
    let tracker = Tracker::new(
        Arc::clone(&storage),
        Arc::new(LockedCounter),
        TrackerConfig::default(),
    );
    let state = Arc::new(AppState::new(tracker, Arc::new(Metrics::new()), fast_retry()));
    (create_router(state), storage, dir)
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn login(app: &Router, username: &str, password: &str) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/login",
        None,
        Some(json!({ "username": username, "password": password })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {}", body);
    body["token"].as_str().unwrap().to_string()
}

/// Logs in and sets the default unit and department.
async fn login_on_unit(app: &Router, username: &str, password: &str) -> String {
    let token = login(app, username, password).await;
    let (status, _) = send(
        app,
        "PUT",
        "/me/defaults",
        Some(&token),
        Some(json!({ "unit": "Unit 1", "department": "Medicine" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    token
}

fn investigation_body(uhid: &str) -> Value {
    json!({
        "uhid": uhid,
        "patient_name": "Ravi Kumar",
        "patient_age": 57,
        "patient_gender": "Male",
        "investigation_type": "LFT"
    })
}

#[tokio::test]
async fn test_health_check() {
    let (app, _dir) = create_test_app();

    let (status, body) = send(&app, "GET", "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_login_rejects_bad_credentials() {
    let (app, _dir) = create_test_app();

    let (status, body) = send(
        &app,
        "POST",
        "/login",
        None,
        Some(json!({ "username": "doctor", "password": "nope" })),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_login_response_omits_password() {
    let (app, _dir) = create_test_app();

    let (_, body) = send(
        &app,
        "POST",
        "/login",
        None,
        Some(json!({ "username": "nurse", "password": "nurse123" })),
    )
    .await;

    assert_eq!(body["user"]["role"], "Nurse");
    assert!(body["user"].get("password").is_none());
}

#[tokio::test]
async fn test_requests_without_token_are_unauthorized() {
    let (app, _dir) = create_test_app();

    let (status, _) = send(&app, "GET", "/investigations/special", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, "GET", "/users", Some("not-a-session"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_logout_ends_session() {
    let (app, _dir) = create_test_app();
    let token = login(&app, "admin", "admin123").await;

    let (status, _) = send(&app, "POST", "/logout", Some(&token), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, "GET", "/users", Some(&token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_investigation_issues_sequential_order_numbers() {
    let (app, _dir) = create_test_app();
    let doctor = login_on_unit(&app, "doctor", "doctor123").await;
    let yy = format!("{:02}", year_prefix(Local::now()));

    let (status, first) = send(
        &app,
        "POST",
        "/investigations",
        Some(&doctor),
        Some(investigation_body("1001")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create failed: {}", first);
    assert_eq!(first["order_no"], format!("{}000001", yy));
    assert_eq!(first["status"], "Pending");
    assert_eq!(first["unit"], "Unit 1");
    assert_eq!(first["final_uhid"], format!("{}1001", yy));

    let (_, second) = send(
        &app,
        "POST",
        "/investigations",
        Some(&doctor),
        Some(investigation_body("1002")),
    )
    .await;
    assert_eq!(second["order_no"], format!("{}000002", yy));

    let (_, stats) = send(&app, "GET", "/stats", None, None).await;
    assert_eq!(stats["orders"]["allocated_total"], 2);
    assert_eq!(stats["orders"]["current_sequence"], 2);
}

#[tokio::test]
async fn test_nurse_cannot_create_investigation() {
    let (app, _dir) = create_test_app();
    let nurse = login_on_unit(&app, "nurse", "nurse123").await;

    let (status, body) = send(
        &app,
        "POST",
        "/investigations",
        Some(&nurse),
        Some(investigation_body("1001")),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");
}

#[tokio::test]
async fn test_done_and_reverse_flow() {
    let (app, _dir) = create_test_app();
    let doctor = login_on_unit(&app, "doctor", "doctor123").await;
    let intern = login_on_unit(&app, "intern", "doctor123").await;

    let (_, created) = send(
        &app,
        "POST",
        "/investigations",
        Some(&doctor),
        Some(investigation_body("2001")),
    )
    .await;
    let order_no = created["order_no"].as_str().unwrap().to_string();

    let (status, done) = send(
        &app,
        "POST",
        &format!("/investigations/{}/done", order_no),
        Some(&intern),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["status"], "Done");

    let (status, body) = send(
        &app,
        "POST",
        &format!("/investigations/{}/done", order_no),
        Some(&intern),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_TRANSITION");

    let (status, reversed) = send(
        &app,
        "POST",
        &format!("/investigations/{}/reverse", order_no),
        Some(&intern),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reversed["status"], "Pending");
    assert!(reversed["done_by"].is_null());
}

#[tokio::test]
async fn test_unknown_and_malformed_order_numbers() {
    let (app, _dir) = create_test_app();
    let pg = login_on_unit(&app, "PG", "doctor123").await;

    let (status, _) = send(&app, "POST", "/investigations/24999999/done", Some(&pg), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, "POST", "/investigations/24-1/done", Some(&pg), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_order_desk_lookup_and_board() {
    let (app, _dir) = create_test_app();
    let doctor = login_on_unit(&app, "doctor", "doctor123").await;
    let nurse = login_on_unit(&app, "nurse", "nurse123").await;

    let (_, created) = send(
        &app,
        "POST",
        "/investigations",
        Some(&doctor),
        Some(investigation_body("3001")),
    )
    .await;
    let order_no = created["order_no"].as_str().unwrap().to_string();

    let (status, found) = send(
        &app,
        "GET",
        &format!("/investigations?order_no={}", order_no),
        Some(&nurse),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found.as_array().unwrap().len(), 1);
    assert_eq!(found[0]["order_no"], order_no.as_str());

    let (status, board) = send(
        &app,
        "GET",
        "/investigations/board?status=Pending",
        Some(&nurse),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(board[0]["investigations"][0]["order_no"], order_no.as_str());

    let (status, _) = send(
        &app,
        "GET",
        "/investigations/board?status=Accepted",
        Some(&nurse),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let patient_id = created["patient_id"].as_str().unwrap();
    let (status, history) = send(
        &app,
        "GET",
        &format!("/patients/{}/investigations", patient_id),
        Some(&nurse),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().unwrap().len(), 1);

    let (status, patients) = send(
        &app,
        "GET",
        "/patients/search?keyword=ravi",
        Some(&nurse),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(patients[0]["name"], "Ravi Kumar");
}

#[tokio::test]
async fn test_locked_counter_returns_retry_message_and_persists_nothing() {
    let (app, storage, _dir) = create_test_app_with_locked_counter();
    let doctor = login_on_unit(&app, "doctor", "doctor123").await;

    let (status, body) = send(
        &app,
        "POST",
        "/investigations",
        Some(&doctor),
        Some(investigation_body("5005")),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "ORDER_NUMBER_UNAVAILABLE");
    assert_eq!(body["error"], "could not allocate an order number, please retry");
    assert!(storage.list_patients().unwrap().is_empty());
    assert!(storage.list_investigations().unwrap().is_empty());

    let (_, stats) = send(&app, "GET", "/stats", None, None).await;
    assert_eq!(stats["orders"]["allocation_failures_total"], 1);
    assert_eq!(stats["orders"]["retries_total"], 2);
    assert_eq!(stats["orders"]["allocated_total"], 0);
}

/// A create waiting on the counter lock must not stall other requests, even on
/// a single-threaded runtime.
#[tokio::test]
async fn test_health_answers_while_create_waits_on_counter() {
    let (storage, _dir) = seeded_storage();
    let counter = Arc::new(SlowCounter::default());
    let tracker = Tracker::new(storage, Arc::clone(&counter), TrackerConfig::default());
    let state = Arc::new(AppState::new(tracker, Arc::new(Metrics::new()), fast_retry()));
    let app = create_router(state);
    let doctor = login_on_unit(&app, "doctor", "doctor123").await;

    let creating = {
        let app = app.clone();
        tokio::spawn(async move {
            send(
                &app,
                "POST",
                "/investigations",
                Some(&doctor),
                Some(investigation_body("1001")),
            )
            .await
        })
    };

    let entered_at = loop {
        if let Some(at) = counter.entered_at.get() {
            break *at;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    };
    let (status, _) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        entered_at.elapsed() < Duration::from_millis(500),
        "health check waited {:?} behind the counter",
        entered_at.elapsed()
    );

    let (status, body) = creating.await.unwrap();
    assert_eq!(status, StatusCode::CREATED, "create failed: {}", body);
}

#[tokio::test]
async fn test_only_admin_lists_users() {
    let (app, _dir) = create_test_app();
    let admin = login(&app, "admin", "admin123").await;
    let doctor = login(&app, "doctor", "doctor123").await;

    let (status, users) = send(&app, "GET", "/users", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(users.as_array().unwrap().len(), 7);

    let (status, _) = send(&app, "GET", "/users", Some(&doctor), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

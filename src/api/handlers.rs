use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::retry::{with_retry, RetryConfig};
use crate::contracts::{
    Investigation, InvestigationStatus, OrderNumber, OrderNumberGenerator, Patient,
    PatientInvestigations, RecordStore, StorageError, TrackerError, User, UserView,
};
use crate::tracker::{CreateInvestigation, Session, Tracker};

/// Server metrics for monitoring.
#[derive(Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub orders_allocated_total: AtomicU64,
    pub order_allocation_failures_total: AtomicU64,
    pub order_retries_total: AtomicU64,
    pub errors_total: AtomicU64,
    pub start_time: std::sync::OnceLock<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        let m = Self::default();
        let _ = m.start_time.set(Instant::now());
        m
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_order_allocated(&self) {
        self.orders_allocated_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allocation_failure(&self) {
        self.order_allocation_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.order_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }
}

/// Application state shared across handlers.
pub struct AppState<S: RecordStore, G: OrderNumberGenerator> {
    pub tracker: Tracker<S, G>,
    pub metrics: Arc<Metrics>,
    pub retry: RetryConfig,
}

impl<S: RecordStore, G: OrderNumberGenerator> AppState<S, G> {
    pub fn new(tracker: Tracker<S, G>, metrics: Arc<Metrics>, retry: RetryConfig) -> Self {
        Self {
            tracker,
            metrics,
            retry,
        }
    }

    /// Counts the error and converts it for the response.
    fn reject(&self, e: impl Into<ApiError>) -> ApiError {
        self.metrics.record_error();
        e.into()
    }

    /// Resolves the `Authorization: Bearer <token>` header to a user.
    fn authenticate(&self, headers: &HeaderMap) -> Result<User, ApiError> {
        let token = bearer_token(headers).ok_or_else(|| {
            self.reject(TrackerError::Unauthorized(
                "Missing bearer token".into(),
            ))
        })?;
        self.tracker.authenticate(token).map_err(|e| self.reject(e))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn parse_order_no(raw: &str) -> Result<OrderNumber, ApiError> {
    raw.parse::<OrderNumber>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Runs a tracker operation that may wait on a row lock on the blocking pool.
async fn blocking<S, G, T, F>(state: &Arc<AppState<S, G>>, op: F) -> Result<T, TrackerError>
where
    S: RecordStore + 'static,
    G: OrderNumberGenerator + 'static,
    T: Send + 'static,
    F: FnOnce(&Tracker<S, G>) -> Result<T, TrackerError> + Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || op(&state.tracker))
        .await
        .map_err(|e| {
            TrackerError::Storage(StorageError::RocksDb(format!("blocking task failed: {}", e)))
        })?
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    Tracker(TrackerError),
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, code, error) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Tracker(e) => match e {
                TrackerError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
                TrackerError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg),
                TrackerError::NotFound(msg)
                | TrackerError::Storage(StorageError::NotFound(msg)) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", msg)
                }
                TrackerError::InvalidInput(msg)
                | TrackerError::Storage(StorageError::InvalidInput(msg)) => {
                    (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg)
                }
                TrackerError::InvalidTransition(msg) => {
                    (StatusCode::CONFLICT, "INVALID_TRANSITION", msg)
                }
                e @ TrackerError::ReversalWindowElapsed { .. } => (
                    StatusCode::CONFLICT,
                    "REVERSAL_WINDOW_ELAPSED",
                    e.to_string(),
                ),
                TrackerError::OrderNumber(failure) if failure.is_retryable() => {
                    tracing::warn!(error = %failure, "Order number allocation failed");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "ORDER_NUMBER_UNAVAILABLE",
                        "could not allocate an order number, please retry".into(),
                    )
                }
                TrackerError::OrderNumber(failure) => {
                    tracing::error!(error = %failure, "Order counter unusable");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "ORDER_COUNTER_FAULT",
                        "the order counter needs attention, contact an administrator".into(),
                    )
                }
                TrackerError::Storage(StorageError::Conflict(msg)) => {
                    (StatusCode::CONFLICT, "CONFLICT", msg)
                }
                TrackerError::Storage(e) => {
                    tracing::error!(error = %e, "Storage failure");
                    (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", e.to_string())
                }
            },
        };

        (
            status,
            Json(ErrorResponse {
                error,
                code: code.into(),
            }),
        )
            .into_response()
    }
}

impl From<TrackerError> for ApiError {
    fn from(e: TrackerError) -> Self {
        ApiError::Tracker(e)
    }
}

/// GET /health
/// Health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy"
    }))
}

/// Response for stats endpoint.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uptime_secs: f64,
    pub requests_total: u64,
    pub orders: OrderStats,
    pub errors_total: u64,
}

#[derive(Debug, Serialize)]
pub struct OrderStats {
    pub allocated_total: u64,
    pub allocation_failures_total: u64,
    pub retries_total: u64,
    /// Last issued sequence, if the counter is readable.
    pub current_sequence: Option<u64>,
}

/// GET /stats
/// Server statistics and metrics.
pub async fn get_stats<S: RecordStore, G: OrderNumberGenerator>(
    State(state): State<Arc<AppState<S, G>>>,
) -> impl IntoResponse {
    let metrics = &state.metrics;

    let uptime_secs = metrics
        .start_time
        .get()
        .map(|t| t.elapsed().as_secs_f64())
        .unwrap_or(0.0);

    Json(StatsResponse {
        uptime_secs,
        requests_total: metrics.requests_total.load(Ordering::Relaxed),
        orders: OrderStats {
            allocated_total: metrics.orders_allocated_total.load(Ordering::Relaxed),
            allocation_failures_total: metrics
                .order_allocation_failures_total
                .load(Ordering::Relaxed),
            retries_total: metrics.order_retries_total.load(Ordering::Relaxed),
            current_sequence: state.tracker.orders().current_sequence().ok(),
        },
        errors_total: metrics.errors_total.load(Ordering::Relaxed),
    })
}

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// POST /login
pub async fn login<S: RecordStore, G: OrderNumberGenerator>(
    State(state): State<Arc<AppState<S, G>>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<Session>, ApiError> {
    state.metrics.record_request();
    let session = state
        .tracker
        .login(&request.username, &request.password)
        .map_err(|e| state.reject(e))?;
    Ok(Json(session))
}

/// POST /logout
pub async fn logout<S: RecordStore, G: OrderNumberGenerator>(
    State(state): State<Arc<AppState<S, G>>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    state.metrics.record_request();
    state.authenticate(&headers)?;
    if let Some(token) = bearer_token(&headers) {
        state.tracker.logout(token);
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Request body for updating default settings.
#[derive(Debug, Deserialize)]
pub struct DefaultSettingsRequest {
    pub unit: String,
    pub department: String,
}

/// PUT /me/defaults
pub async fn set_default_settings<S: RecordStore + 'static, G: OrderNumberGenerator + 'static>(
    State(state): State<Arc<AppState<S, G>>>,
    headers: HeaderMap,
    Json(request): Json<DefaultSettingsRequest>,
) -> Result<Json<UserView>, ApiError> {
    state.metrics.record_request();
    let actor = state.authenticate(&headers)?;
    let user = blocking(&state, move |tracker| {
        tracker.set_default_settings(&actor, &request.unit, &request.department)
    })
    .await
    .map_err(|e| state.reject(e))?;
    Ok(Json(user))
}

/// GET /users
pub async fn list_users<S: RecordStore, G: OrderNumberGenerator>(
    State(state): State<Arc<AppState<S, G>>>,
    headers: HeaderMap,
) -> Result<Json<Vec<UserView>>, ApiError> {
    state.metrics.record_request();
    let actor = state.authenticate(&headers)?;
    let users = state
        .tracker
        .list_users(&actor)
        .map_err(|e| state.reject(e))?;
    Ok(Json(users))
}

/// Query parameters for patient search.
#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub keyword: String,
}

/// GET /patients/search?keyword=
pub async fn search_patients<S: RecordStore, G: OrderNumberGenerator>(
    State(state): State<Arc<AppState<S, G>>>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<Patient>>, ApiError> {
    state.metrics.record_request();
    let actor = state.authenticate(&headers)?;
    let patients = state
        .tracker
        .search_patients(&actor, &query.keyword)
        .map_err(|e| state.reject(e))?;
    Ok(Json(patients))
}

/// GET /patients/{id}/investigations
pub async fn investigations_for_patient<S: RecordStore, G: OrderNumberGenerator>(
    State(state): State<Arc<AppState<S, G>>>,
    headers: HeaderMap,
    Path(patient_id): Path<String>,
) -> Result<Json<Vec<Investigation>>, ApiError> {
    state.metrics.record_request();
    let actor = state.authenticate(&headers)?;
    let patient_id = Uuid::parse_str(&patient_id).map_err(|e| {
        state.reject(ApiError::BadRequest(format!("Invalid patient id: {}", e)))
    })?;
    let investigations = state
        .tracker
        .investigations_for_patient(&actor, patient_id)
        .map_err(|e| state.reject(e))?;
    Ok(Json(investigations))
}

/// Query parameters for listing investigations.
#[derive(Debug, Deserialize)]
pub struct InvestigationsQuery {
    pub order_no: Option<String>,
}

/// GET /investigations?order_no=
pub async fn list_investigations<S: RecordStore, G: OrderNumberGenerator>(
    State(state): State<Arc<AppState<S, G>>>,
    headers: HeaderMap,
    Query(query): Query<InvestigationsQuery>,
) -> Result<Json<Vec<Investigation>>, ApiError> {
    state.metrics.record_request();
    let actor = state.authenticate(&headers)?;
    let order_no = query
        .order_no
        .as_deref()
        .map(parse_order_no)
        .transpose()
        .map_err(|e| state.reject(e))?;
    let investigations = state
        .tracker
        .investigations(&actor, order_no)
        .map_err(|e| state.reject(e))?;
    Ok(Json(investigations))
}

/// GET /investigations/special
pub async fn special_investigations<S: RecordStore, G: OrderNumberGenerator>(
    State(state): State<Arc<AppState<S, G>>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Investigation>>, ApiError> {
    state.metrics.record_request();
    let actor = state.authenticate(&headers)?;
    let investigations = state
        .tracker
        .special_investigations(&actor)
        .map_err(|e| state.reject(e))?;
    Ok(Json(investigations))
}

/// Query parameters for the unit board.
#[derive(Debug, Deserialize)]
pub struct BoardQuery {
    pub status: Option<String>,
}

/// GET /investigations/board?status=
pub async fn unit_board<S: RecordStore, G: OrderNumberGenerator>(
    State(state): State<Arc<AppState<S, G>>>,
    headers: HeaderMap,
    Query(query): Query<BoardQuery>,
) -> Result<Json<Vec<PatientInvestigations>>, ApiError> {
    state.metrics.record_request();
    let actor = state.authenticate(&headers)?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<InvestigationStatus>)
        .transpose()
        .map_err(|e| state.reject(ApiError::BadRequest(e)))?;
    let board = state
        .tracker
        .unit_board(&actor, status, Utc::now())
        .map_err(|e| state.reject(e))?;
    Ok(Json(board))
}

/// POST /investigations
/// Creates an investigation, retrying transient order-number failures.
pub async fn create_investigation<S: RecordStore + 'static, G: OrderNumberGenerator + 'static>(
    State(state): State<Arc<AppState<S, G>>>,
    headers: HeaderMap,
    Json(request): Json<CreateInvestigation>,
) -> Result<(StatusCode, Json<Investigation>), ApiError> {
    state.metrics.record_request();
    let actor = state.authenticate(&headers)?;

    let shared = &state;
    let actor = &actor;
    let request = &request;
    let attempt = move || {
        let actor = actor.clone();
        let request = request.clone();
        async move {
            blocking(shared, move |tracker| {
                tracker.create_investigation(&actor, request, Local::now())
            })
            .await
        }
    };
    let result = with_retry(&state.retry, "create investigation", &state.metrics, attempt).await;

    match result {
        Ok(investigation) => {
            state.metrics.record_order_allocated();
            Ok((StatusCode::CREATED, Json(investigation)))
        }
        Err(e) => {
            if matches!(e, TrackerError::OrderNumber(_)) {
                state.metrics.record_allocation_failure();
            }
            Err(state.reject(e))
        }
    }
}

/// POST /investigations/{order_no}/done
pub async fn mark_done<S: RecordStore + 'static, G: OrderNumberGenerator + 'static>(
    State(state): State<Arc<AppState<S, G>>>,
    headers: HeaderMap,
    Path(order_no): Path<String>,
) -> Result<Json<Investigation>, ApiError> {
    state.metrics.record_request();
    let actor = state.authenticate(&headers)?;
    let order_no = parse_order_no(&order_no).map_err(|e| state.reject(e))?;
    let investigation = blocking(&state, move |tracker| {
        tracker.mark_done(&actor, order_no, Utc::now())
    })
    .await
    .map_err(|e| state.reject(e))?;
    Ok(Json(investigation))
}

/// POST /investigations/{order_no}/reverse
pub async fn reverse_done<S: RecordStore + 'static, G: OrderNumberGenerator + 'static>(
    State(state): State<Arc<AppState<S, G>>>,
    headers: HeaderMap,
    Path(order_no): Path<String>,
) -> Result<Json<Investigation>, ApiError> {
    state.metrics.record_request();
    let actor = state.authenticate(&headers)?;
    let order_no = parse_order_no(&order_no).map_err(|e| state.reject(e))?;
    let investigation = blocking(&state, move |tracker| {
        tracker.reverse_done(&actor, order_no, Utc::now())
    })
    .await
    .map_err(|e| state.reject(e))?;
    Ok(Json(investigation))
}

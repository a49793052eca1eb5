mod handlers;
mod retry;

use std::future::Future;
use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;

use crate::contracts::{OrderNumberGenerator, RecordStore};

pub use handlers::{
    ApiError, AppState, DefaultSettingsRequest, ErrorResponse, LoginRequest, Metrics,
    StatsResponse,
};
pub use retry::{with_retry, RetryConfig};

/// Creates the API router.
pub fn create_router<S, G>(state: Arc<AppState<S, G>>) -> Router
where
    S: RecordStore + 'static,
    G: OrderNumberGenerator + 'static,
{
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/stats", get(handlers::get_stats::<S, G>))
        .route("/login", post(handlers::login::<S, G>))
        .route("/logout", post(handlers::logout::<S, G>))
        .route("/me/defaults", put(handlers::set_default_settings::<S, G>))
        .route("/users", get(handlers::list_users::<S, G>))
        .route("/patients/search", get(handlers::search_patients::<S, G>))
        .route(
            "/patients/:id/investigations",
            get(handlers::investigations_for_patient::<S, G>),
        )
        .route(
            "/investigations",
            get(handlers::list_investigations::<S, G>).post(handlers::create_investigation::<S, G>),
        )
        .route(
            "/investigations/special",
            get(handlers::special_investigations::<S, G>),
        )
        .route("/investigations/board", get(handlers::unit_board::<S, G>))
        .route(
            "/investigations/:order_no/done",
            post(handlers::mark_done::<S, G>),
        )
        .route(
            "/investigations/:order_no/reverse",
            post(handlers::reverse_done::<S, G>),
        )
        .with_state(state)
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 4000,
        }
    }
}

impl ServerConfig {
    /// Creates a config from environment variables.
    ///
    /// Reads:
    /// - `INVTRACK_HOST`: Bind address (default: 0.0.0.0)
    /// - `INVTRACK_PORT`: Listen port (default: 4000)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            host: std::env::var("INVTRACK_HOST").unwrap_or(default.host),
            port: std::env::var("INVTRACK_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(default.port),
        }
    }
}

/// Starts the HTTP server.
pub async fn start_server<S, G, F>(
    config: ServerConfig,
    state: Arc<AppState<S, G>>,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: RecordStore + 'static,
    G: OrderNumberGenerator + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    tracing::info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

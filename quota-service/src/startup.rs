//! Application startup and lifecycle management.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::QuotaConfig;
use crate::handlers;
use crate::services::{
    get_metrics, init_metrics, Database, MemoryStore, PlanLookup, QuotaService, QuotaStore,
    StaticPlanCatalog, SystemClock,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub quota: Arc<QuotaService>,
}

impl AppState {
    pub fn new(quota: Arc<QuotaService>) -> Self {
        Self { quota }
    }
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.quota.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "quota-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "quota-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.quota.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// HTTP routes of the service.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route("/v1/quota/consume", post(handlers::consume))
        .route("/v1/quota/refund", post(handlers::refund))
        .route(
            "/v1/users/:user_id/usage/:metric",
            get(handlers::get_usage),
        )
        .route(
            "/v1/users/:user_id/balance",
            get(handlers::get_balance).post(handlers::open_balance),
        )
        .route("/v1/users/:user_id/buckets", post(handlers::grant_bucket))
        .route(
            "/v1/users/:user_id/daily-gift",
            post(handlers::grant_daily_gift),
        )
        .route(
            "/v1/users/:user_id/time/consume",
            post(handlers::consume_time),
        )
        .route(
            "/v1/users/:user_id/auto-top-up",
            put(handlers::configure_auto_top_up),
        )
        .route(
            "/v1/users/:user_id/bonus-grants",
            post(handlers::add_bonus_grant),
        )
        .route("/v1/users/:user_id/audit", get(handlers::list_audit))
        .route(
            "/v1/events/subscription-changed",
            post(handlers::subscription_changed),
        )
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: QuotaConfig) -> Result<Self, AppError> {
        init_metrics();

        let store: Arc<dyn QuotaStore> = match &config.database {
            Some(database) => {
                let db = Database::new(
                    &database.url,
                    database.max_connections,
                    database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;

                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;

                Arc::new(db)
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-process store");
                Arc::new(MemoryStore::new())
            }
        };

        let plans: Arc<dyn PlanLookup> = Arc::new(StaticPlanCatalog::with_default_plans());
        let quota = Arc::new(QuotaService::new(
            store,
            plans,
            Arc::new(SystemClock),
            config.quota.clone(),
        ));
        let state = AppState::new(quota);

        let addr: SocketAddr = config.common.bind_address().parse().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Invalid bind address: {}", e))
        })?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Quota service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let maintenance = spawn_maintenance(self.state.quota.clone());

        let app = router(self.state);

        tracing::info!(
            service = "quota-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        let result = axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;

        maintenance.abort();

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}

/// Periodic pruning and deferred-audit flushing.
fn spawn_maintenance(quota: Arc<QuotaService>) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(quota.settings().maintenance_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = quota.run_maintenance().await {
                tracing::error!(error = %e, "Maintenance run failed");
            }
        }
    })
}

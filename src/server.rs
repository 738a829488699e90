// HTTP server for the guarded generation API
//
// Routes:
// - POST /api/generate          question generation (rate limited, quota governed)
// - GET  /rate-limit/{endpoint} dry-run probe of an endpoint's limits
// - GET  /quota/status          upstream quota snapshot
// - GET  /metrics               Prometheus text format
// - GET  /health                liveness

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::metrics;
use crate::quota::error::ceil_secs;
use crate::quota::{HttpProvider, QuotaError, QuotaGovernor, QuotaStatus};
use crate::rate_limit::config::GENERATE_ENDPOINT;
use crate::rate_limit::middleware::{enforce, EndpointGuard};
use crate::rate_limit::{Enforcement, MemoryStore, RateLimiter};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub limiter: RateLimiter,
    pub governor: Arc<QuotaGovernor>,
    /// Fires on shutdown; in-flight generations are abandoned
    pub shutdown: CancellationToken,
    pub metrics_enabled: bool,
}

impl AppState {
    pub fn new(limiter: RateLimiter, governor: Arc<QuotaGovernor>) -> Self {
        Self {
            limiter,
            governor,
            shutdown: CancellationToken::new(),
            metrics_enabled: true,
        }
    }

    /// Build the limiter, provider and governor described by `config`
    ///
    /// # Errors
    ///
    /// Fails when the provider API key is missing or the HTTP client cannot
    /// be built.
    pub fn from_config(config: &Config, shutdown: CancellationToken) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(config.rate_limit.clone(), store);

        let settings = config.provider.settings()?;
        let provider = HttpProvider::new(settings).context("Failed to build provider client")?;
        let governor = QuotaGovernor::new(Arc::new(provider), config.quota.clone());

        Ok(Self {
            limiter,
            governor: Arc::new(governor),
            shutdown,
            metrics_enabled: config.metrics.enabled,
        })
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    let guard = EndpointGuard::new(state.limiter.clone(), GENERATE_ENDPOINT);

    let generate = Router::new()
        .route("/api/generate", post(generate_handler))
        .route_layer(middleware::from_fn_with_state(guard, enforce));

    let mut app = Router::new()
        .merge(generate)
        .route("/rate-limit/{endpoint}", get(probe_handler))
        .route("/quota/status", get(quota_status_handler))
        .route("/health", get(health_handler));

    if state.metrics_enabled {
        app = app.route("/metrics", get(metrics_handler));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve until `state.shutdown` fires
pub async fn serve(config: &Config, state: AppState) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;

    let addr = config.server.bind_addr()?;
    let shutdown = state.shutdown.clone();
    let app = router(state);

    info!("Starting quotaguard server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await
    .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

/// Body of `POST /api/generate`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub prompt: String,

    /// Attempt budget; defaults to the configured `max_retries`
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Successful generation
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub request_id: String,
    pub text: String,
}

/// Query of `GET /rate-limit/{endpoint}`
#[derive(Debug, Default, Deserialize)]
pub struct ProbeQuery {
    pub user: Option<String>,
    pub ip: Option<String>,
}

/// Governor failure as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub QuotaError);

impl From<QuotaError> for ApiError {
    fn from(err: QuotaError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            QuotaError::RateLimited { .. }
            | QuotaError::WouldExceed { .. }
            | QuotaError::ExhaustedAfterRetries { .. } => StatusCode::TOO_MANY_REQUESTS,
            QuotaError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            QuotaError::Provider(_) => StatusCode::BAD_GATEWAY,
        };
        let retry_after = err.retry_after().map(|d| ceil_secs(&d));

        let mut response = (
            status,
            Json(json!({
                "error": err.to_string(),
                "code": err.code(),
                "retryAfter": retry_after,
            })),
        )
            .into_response();

        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

async fn generate_handler(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, Response> {
    if request.prompt.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "prompt must not be empty", "code": "INVALID_REQUEST" })),
        )
            .into_response());
    }

    let request_id = uuid::Uuid::new_v4().to_string();
    let max_retries = request
        .max_retries
        .unwrap_or(state.governor.config().max_retries);

    let text = state
        .governor
        .generate_with_quota_management(&request.prompt, max_retries, &state.shutdown)
        .await
        .map_err(|e| {
            info!(request_id = %request_id, code = e.code(), "Generation refused");
            ApiError(e).into_response()
        })?;

    Ok(Json(GenerateResponse { request_id, text }))
}

async fn probe_handler(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(query): Query<ProbeQuery>,
) -> Result<Json<Enforcement>, Response> {
    state
        .limiter
        .enforce_rate_limit(&endpoint, query.user.as_deref(), query.ip.as_deref(), true)
        .await
        .map(Json)
        .map_err(|e| {
            error!(endpoint = %endpoint, error = %e, "Rate limit probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        })
}

async fn quota_status_handler(State(state): State<AppState>) -> Json<QuotaStatus> {
    Json(state.governor.quota_status().await)
}

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

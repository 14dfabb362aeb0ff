mod catalog;
mod config;
mod fal;
mod guard;
mod http;
mod idempotency;
mod jobs;
mod metrics;
mod models;
mod persist;
mod pipeline;
mod prompt;
mod security;
mod supabase;

use axum::{
    Json, Router,
    extract::{Extension, Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use config::AppConfig;
use eyre::WrapErr;
use idempotency::{IdempotencyStore, Reservation};
use jobs::JobQueue;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, ComposeRequest, ComposeResponse, PromptPreview};
use once_cell::sync::Lazy;
use pipeline::{Pipeline, PipelineError};
use security::{AuthContext, AuthState, require_admin_auth};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, time::Instant};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

static OPENAPI: Lazy<serde_json::Value> = Lazy::new(|| {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({ "openapi": "3.0.3" }))
});

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "compose.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    let pipeline = Pipeline::from_config(&config).wrap_err("building composition pipeline")?;
    let (queue, _worker) = JobQueue::spawn(pipeline.clone(), config.queue_capacity, config.job_ttl);
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;
    crate::metrics::describe();
    let upkeep = prometheus_handle.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            tick.tick().await;
            upkeep.run_upkeep();
        }
    });
    let redis = match config.redis_url.as_deref() {
        Some(url) => match redis::Client::open(url) {
            Ok(client) => Some(client),
            Err(err) => {
                warn!(target = "compose.api", error = %err, "invalid REDIS_URL; idempotency stays in memory");
                None
            }
        },
        None => None,
    };

    let state = AppState {
        pipeline,
        queue,
        idempotency: IdempotencyStore::new(redis, config.idempotency_ttl_secs),
        prometheus_handle,
        metrics_key: config.metrics_key.clone(),
        openapi_key: config.openapi_key.clone(),
    };
    let auth = AuthState::new(&config.admin_keys, config.rate_limit);
    let app = build_router(state, auth, config.request_max_bytes);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "compose.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: JobQueue,
    idempotency: IdempotencyStore,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
    openapi_key: Option<String>,
}

fn build_router(state: AppState, auth: AuthState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/compose", post(compose))
        .route("/compose/preview", post(compose_preview))
        .nest(
            "/jobs",
            Router::new()
                .route("/compose", post(enqueue_compose_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth, require_admin_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "compose-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Some(key) = &state.openapi_key
        && header_value(&headers, "X-Docs-Key") != Some(key.as_str())
    {
        return Err(AppError::Unauthorized);
    }
    Ok(Json(OPENAPI.clone()))
}

async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Compose API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#,
    )
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key
        && header_value(&headers, "X-Metrics-Key") != Some(secret.as_str())
    {
        return AppError::Unauthorized.into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Compose a catalog product into a photograph.
///
/// - Method: `POST`
/// - Path: `/compose`
/// - Auth: `Authorization: Bearer <key>` or `X-Admin-Key: <key>`
/// - Body: `ComposeRequest`
/// - Response: `ComposeResponse`; per-image storage failures are reported
///   inline and do not fail the request.
///
/// A repeated `Idempotency-Key` from the same caller replays the first response.
/// Reusing a key while it is running, or with a different body, is a 409.
async fn compose(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: HeaderMap,
    payload: Result<Json<ComposeRequest>, JsonRejection>,
) -> Result<Json<ComposeResponse>, AppError> {
    crate::metrics::inc_requests("/compose");
    let started = Instant::now();
    let Json(request) = payload?;
    info!(
        target = "compose.api",
        caller = %context.caller,
        api_key = %context.key_id,
        product = request.product_id.as_deref().unwrap_or("-"),
        method = request.composition_method.as_str(),
        "composition invoked",
    );

    let idempotency = match header_value(&headers, "Idempotency-Key") {
        Some(key) => {
            let key = format!("{}:{key}", context.caller);
            let fingerprint = serde_json::to_string(&request)
                .map_err(|err| AppError::Internal(err.to_string()))?;
            match state.idempotency.begin(&key, &fingerprint).await {
                Reservation::Reserved => Some((key, fingerprint)),
                Reservation::Replay(existing) => {
                    info!(target = "compose.api", caller = %context.caller, "idempotent replay");
                    return Ok(Json(*existing));
                }
                Reservation::InFlight => {
                    return Err(AppError::Conflict(
                        "a request with this Idempotency-Key is still running".into(),
                    ));
                }
                Reservation::Mismatch => {
                    return Err(AppError::Conflict(
                        "Idempotency-Key was already used with a different request body".into(),
                    ));
                }
            }
        }
        None => None,
    };

    match state.pipeline.run(request).await {
        Ok(response) => {
            if let Some((key, fingerprint)) = &idempotency {
                state.idempotency.complete(key, fingerprint, &response).await;
            }
            Ok(Json(response))
        }
        Err(err) => {
            if let Some((key, _)) = &idempotency {
                state.idempotency.release(key).await;
            }
            Err(AppError::pipeline(err, started))
        }
    }
}

/// Dry run: the prompt and image list `/compose` would send, without generating.
async fn compose_preview(
    State(state): State<AppState>,
    payload: Result<Json<ComposeRequest>, JsonRejection>,
) -> Result<Json<PromptPreview>, AppError> {
    crate::metrics::inc_requests("/compose/preview");
    let started = Instant::now();
    let Json(request) = payload?;
    let preview = state
        .pipeline
        .preview(&request)
        .await
        .map_err(|err| AppError::pipeline(err, started))?;
    Ok(Json(preview))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_compose_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    payload: Result<Json<ComposeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    crate::metrics::inc_requests("/jobs/compose");
    let Json(request) = payload?;
    let id = state
        .queue
        .enqueue(request, context)
        .await
        .map_err(|err| AppError::Internal(err.to_string()))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::BadRequest(format!("invalid job id: {id}")));
    };
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job not found: {id}")))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[derive(Debug)]
enum AppError {
    Pipeline {
        err: PipelineError,
        elapsed_ms: u64,
    },
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unauthorized,
    Internal(String),
}

impl AppError {
    fn pipeline(err: PipelineError, started: Instant) -> Self {
        Self::Pipeline {
            err,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(format!("malformed request body: {}", rejection.body_text()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Pipeline { err, elapsed_ms } => {
                let status = if err.kind().is_client_error() {
                    StatusCode::BAD_REQUEST
                } else {
                    error!(target = "compose.api", stage = err.stage(), error = %err, "composition failed");
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                let payload = ApiError {
                    stage: Some(err.stage().to_string()),
                    processing_time_ms: Some(elapsed_ms),
                    ..ApiError::new(err.detail())
                };
                (status, payload)
            }
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, ApiError::new(message)),
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, ApiError::new(message)),
            AppError::Conflict(message) => (StatusCode::CONFLICT, ApiError::new(message)),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, ApiError::new("unauthorized")),
            AppError::Internal(message) => {
                error!(target = "compose.api", error = %message, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, ApiError::new(message))
            }
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

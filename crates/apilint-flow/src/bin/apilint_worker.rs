//! apilint worker process.
//!
//! One process = one executor: it runs the document, version, and roll-up
//! loops against the shared Postgres store and exposes the validation
//! ingress plus a health probe over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::catch_panic::CatchPanicLayer;

use apilint_core::observability::{init_logging, LogFormat};
use apilint_core::{ErrorBody, ExecutorId};
use apilint_flow::error::{Error, Result};
use apilint_flow::hub::http::HttpHubClient;
use apilint_flow::ingress::Ingress;
use apilint_flow::linter::spectral::SpectralRunner;
use apilint_flow::linter::DocumentLinter;
use apilint_flow::runtime::{PipelineConfig, PipelineRuntime};
use apilint_flow::store::postgres::PgTaskStore;

#[derive(Clone)]
struct AppState {
    ingress: Arc<Ingress>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateRequest {
    package_id: String,
    version: String,
    #[serde(default)]
    revision: i32,
    #[serde(default)]
    event_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidateResponse {
    task_id: String,
}

#[derive(Debug)]
struct ApiError(ErrorBody);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error.to_body())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn validate_handler(
    State(state): State<AppState>,
    Json(request): Json<ValidateRequest>,
) -> std::result::Result<Json<ValidateResponse>, ApiError> {
    let task_id = state
        .ingress
        .validate_version(
            &request.package_id,
            &request.version,
            request.revision,
            request.event_id,
        )
        .await?;

    Ok(Json(ValidateResponse {
        task_id: task_id.to_string(),
    }))
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::configuration(format!("missing {key}")))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn log_format_from_env() -> LogFormat {
    match std::env::var("APILINT_LOG_FORMAT") {
        Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

/// Parses `LISTEN_ADDRESS` values like `:8080` or `0.0.0.0:9000`.
fn resolve_listen_address() -> Result<SocketAddr> {
    let raw = optional_env("LISTEN_ADDRESS").unwrap_or_else(|| ":8080".to_string());
    let normalized = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.clone()
    };
    normalized
        .parse()
        .map_err(|_| Error::configuration(format!("invalid LISTEN_ADDRESS '{raw}'")))
}

#[tokio::main]
async fn main() -> Result<()> {
    // LOG_LEVEL is the boundary-facing knob; RUST_LOG wins when both are
    // set because it can carry per-target directives.
    if std::env::var("RUST_LOG").is_err() {
        if let Some(level) = optional_env("LOG_LEVEL") {
            std::env::set_var("RUST_LOG", level);
        }
    }
    init_logging(log_format_from_env());

    let database_url = required_env("APILINT_DATABASE_URL")?;
    let hub_base_url = required_env("APILINT_HUB_BASE_URL")?;
    let hub_token = optional_env("APILINT_HUB_TOKEN");
    let spectral_bin =
        optional_env("APILINT_SPECTRAL_BIN").unwrap_or_else(|| "spectral".to_string());
    let listen_address = resolve_listen_address()?;
    let config = PipelineConfig::from_env()?;

    let executor_id = ExecutorId::generate();
    tracing::info!(%executor_id, "starting apilint worker");

    let store = PgTaskStore::connect(&database_url, config.lease_ttl_chrono()).await?;
    store.migrate().await?;

    let hub = HttpHubClient::new(hub_base_url, hub_token);
    let linter = SpectralRunner::new(&spectral_bin)
        .await
        .map_err(|e| Error::configuration(format!("spectral probe failed: {e}")))?;
    tracing::info!(version = linter.version(), "spectral detected");

    let runtime = PipelineRuntime::new(
        Arc::new(store),
        Arc::new(hub),
        Arc::new(linter),
        executor_id,
        config,
    );
    let pipeline = runtime.start();

    let state = AppState {
        ingress: pipeline.ingress(),
    };
    // Handler panics become 500 responses instead of dropped connections.
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/validate", post(validate_handler))
        .layer(CatchPanicLayer::new())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen_address)
        .await
        .map_err(|e| Error::configuration(format!("failed to bind {listen_address}: {e}")))?;
    tracing::info!(%listen_address, "listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    });
    serve
        .await
        .map_err(|e| Error::configuration(format!("server error: {e}")))?;

    pipeline.shutdown().await;
    Ok(())
}

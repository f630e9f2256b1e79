//! HTTP server exposing command resolution.

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info, instrument, warn};

use crate::{
    coordinator::Coordinator,
    error::ResolveError,
    executor::{Executor, SimulatedExecutor},
    key::CommandKey,
    middleware::{create_body_limit_layer, request_logging_middleware},
    settings::Settings,
    store::{FileStore, MemoryStore, Store},
};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub executor: Arc<dyn Executor>,
    pub settings: Arc<Settings>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>, executor: Arc<dyn Executor>, settings: Settings) -> Self {
        Self {
            coordinator,
            executor,
            settings: Arc::new(settings),
            started_at: Instant::now(),
        }
    }
}

/// Command execution request
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub id: i64,
}

/// Command execution result
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub cmd: String,
    pub id: i64,
    pub result: String,
}

/// Error body returned for every failed request
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub cached_entries: usize,
    pub in_flight_keys: usize,
    pub executions: u64,
}

/// Request rejected before it reaches the coordinator.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid request: 'cmd' and 'id' are required")]
    MissingFields,

    #[error("invalid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("error reading request body: {0}")]
    Unreadable(String),
}

/// Errors produced by the HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("timed out waiting for result")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(ValidationError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Resolve(ResolveError::Execution(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Resolve(ResolveError::Persistence(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            // Store internals stay in the logs.
            ApiError::Resolve(ResolveError::Persistence(_)) => "error saving result".to_string(),
            other => other.to_string(),
        };
        (self.status(), Json(ErrorResponse { error: message })).into_response()
    }
}

impl CommandRequest {
    /// Parse and validate a raw request body into a request and its cache key.
    pub fn parse(body: &[u8]) -> Result<(Self, CommandKey), ValidationError> {
        let request: CommandRequest =
            serde_json::from_slice(body).map_err(ValidationError::Malformed)?;

        if request.cmd.is_empty() || request.id == 0 {
            return Err(ValidationError::MissingFields);
        }

        let key = CommandKey::new(request.id, &request.cmd);
        Ok((request, key))
    }
}

/// Create the HTTP router with all endpoints and middleware
pub fn create_router(state: AppState) -> Router {
    let body_limit_layer = create_body_limit_layer(state.settings.server.max_body_bytes);

    Router::new()
        .route("/cmd", post(execute_command))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(body_limit_layer)
}

/// Resolve a command, executing it only if no result is stored yet
#[instrument(skip(state, body))]
async fn execute_command(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<CommandResponse>, ApiError> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ValidationError::TooLarge {
                limit: state.settings.server.max_body_bytes,
            }
        } else {
            ValidationError::Unreadable(rejection.body_text())
        }
    })?;

    let (request, key) = CommandRequest::parse(&body)?;

    // The resolution runs on its own task so that neither a timeout nor a
    // dropped connection can interrupt a computation other callers wait on.
    let coordinator = state.coordinator.clone();
    let executor = state.executor.clone();
    let command = request.cmd.clone();
    let task = tokio::spawn(async move {
        coordinator
            .resolve(&key, move || async move { executor.execute(&command).await })
            .await
    });

    let resolved = match tokio::time::timeout(state.settings.server.request_timeout(), task).await {
        Ok(Ok(outcome)) => outcome?,
        Ok(Err(join_error)) => {
            error!("Resolution task failed: {}", join_error);
            return Err(ApiError::Internal("resolution task failed".to_string()));
        }
        Err(_) => {
            warn!("Request for {}+{} timed out, resolution continues", request.id, request.cmd);
            return Err(ApiError::Timeout);
        }
    };

    Ok(Json(CommandResponse {
        cmd: request.cmd,
        id: request.id,
        result: resolved.result,
    }))
}

/// Health check endpoint
#[instrument(skip(state))]
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        cached_entries: state.coordinator.cached_entries().await,
        in_flight_keys: state.coordinator.in_flight(),
        executions: state.executor.executions(),
    })
}

/// Open the configured store backend
pub async fn open_store(settings: &Settings) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match settings.store.backend.as_str() {
        "memory" => {
            warn!("Using in-memory store, results will not survive a restart");
            Arc::new(MemoryStore::new())
        }
        _ => Arc::new(FileStore::open(&settings.store.path).await?),
    };
    Ok(store)
}

/// Start the HTTP server and wait for shutdown signal
pub async fn serve(settings: &Settings) -> Result<()> {
    let store = open_store(settings).await?;
    let coordinator = Arc::new(Coordinator::new(store));
    let executor: Arc<dyn Executor> = Arc::new(SimulatedExecutor::new(settings.executor.clone()));

    let app = create_router(AppState::new(coordinator, executor, settings.clone()));

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Server is running on http://{}", listener.local_addr()?);

    serve_with_shutdown(listener, app, wait_for_shutdown(), settings.server.shutdown_timeout()).await
}

/// Serve `app` until `signal` completes, then give in-flight requests up to
/// `grace` to finish before the server task is aborted.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    app: Router,
    signal: F,
    grace: Duration,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let shutdown = Arc::new(Notify::new());
    let server = {
        let shutdown = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.notified().await })
    };
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        outcome = &mut server => {
            outcome??;
            return Ok(());
        }
        _ = signal => {}
    }

    shutdown.notify_one();
    match tokio::time::timeout(grace, &mut server).await {
        Ok(outcome) => outcome??,
        Err(_) => {
            warn!("In-flight requests did not finish within {:?}, aborting", grace);
            server.abort();
        }
    }

    info!("HTTP server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        }
    }
}

//! HTTP control plane for skillosd.
//!
//! Local-only REST API over the orchestrator plus an SSE feed of
//! invocation and run events.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use skillos_core::{CircuitSnapshot, HandlerManifest, RoutingMode, RunConfig, RunResult};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::orchestrator::{Orchestrator, OrchestratorError};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub auth_token: Option<String>,
    /// Limits applied when a request leaves them unset.
    pub run_defaults: RunConfig,
    /// Parent token for every run started over HTTP.
    pub shutdown: CancellationToken,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/runs", post(create_run))
        .route("/circuits", get(list_circuits))
        .route("/circuits/{name}", get(get_circuit))
        .route("/handlers", get(list_handlers))
        .route("/events", get(stream_events))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);

    // Local-only.
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

/// Validate auth token if configured.
pub fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if let Some(expected) = &state.auth_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

        match provided {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(api_error(StatusCode::UNAUTHORIZED, "invalid auth token")),
            None => Err(api_error(StatusCode::UNAUTHORIZED, "missing auth token")),
        }
    } else {
        Ok(())
    }
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Request payload for POST /runs.
#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub task: String,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub routing_mode: Option<RoutingMode>,
}

/// Response for POST /runs.
#[derive(Debug, Serialize)]
pub struct CreateRunResponse {
    pub run: RunResult,
}

/// Response for GET /circuits.
#[derive(Debug, Serialize)]
pub struct ListCircuitsResponse {
    pub circuits: Vec<CircuitSnapshot>,
    /// True when the shared circuit store failed and state is process-local.
    pub degraded: bool,
}

/// Response for GET /circuits/{name}.
#[derive(Debug, Serialize)]
pub struct GetCircuitResponse {
    pub circuit: CircuitSnapshot,
}

/// Response for GET /handlers.
#[derive(Debug, Serialize)]
pub struct ListHandlersResponse {
    pub handlers: Vec<HandlerManifest>,
}

// --- Handlers ---

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /runs - Execute a task and return the finished run.
async fn create_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let config = RunConfig {
        max_steps: req.max_steps.unwrap_or(state.run_defaults.max_steps),
        timeout_seconds: req
            .timeout_seconds
            .unwrap_or(state.run_defaults.timeout_seconds),
        routing_mode: req.routing_mode.unwrap_or(state.run_defaults.routing_mode),
    };

    let run = state
        .orchestrator
        .run(&req.task, config, state.shutdown.child_token())
        .await
        .map_err(|e| match e {
            OrchestratorError::EmptyTask | OrchestratorError::InvalidConfig(_) => {
                api_error(StatusCode::BAD_REQUEST, e.to_string())
            }
            OrchestratorError::UnregisteredHandler(_) | OrchestratorError::UnknownHandler(_) => {
                warn!(error = %e, "run aborted");
                api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        })?;

    Ok((StatusCode::CREATED, Json(CreateRunResponse { run })))
}

/// GET /circuits - Breaker state for every registered handler.
async fn list_circuits(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    Ok(Json(ListCircuitsResponse {
        circuits: state.orchestrator.circuits().await,
        degraded: state.orchestrator.breakers().is_degraded(),
    }))
}

/// GET /circuits/{name} - Breaker state for one handler.
async fn get_circuit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let circuit = state
        .orchestrator
        .circuit_state(&name)
        .await
        .map_err(|e| api_error(StatusCode::NOT_FOUND, e.to_string()))?;

    Ok(Json(GetCircuitResponse { circuit }))
}

/// GET /handlers - Registered manifests, ordered by name.
async fn list_handlers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    Ok(Json(ListHandlersResponse {
        handlers: state.orchestrator.handlers(),
    }))
}

/// GET /events - Live event feed (SSE).
///
/// Only events emitted after the client connects are delivered. A client
/// that falls behind skips the events it missed.
async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    check_auth(&state, &headers)?;

    let rx = state.orchestrator.events().subscribe();
    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    let sse = SseEvent::default()
                        .event(event.event_type.as_str())
                        .id(event.id.to_string())
                        .data(json);
                    return Some((Ok(sse), rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

//! HTTP surface for the step executor.
//!
//! Routes:
//! - `POST /step/start` starts a step (idempotent per id)
//! - `POST /step/poll` waits for a step's terminal status
//! - `GET /step/{id}/output` streams output as server-sent events
//! - `GET /health`

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
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
use step_core::{LogConfig, StepRequest, TiConfig};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::executor::{ExecutorError, StepExecutor};
use crate::log_client::LogClient;

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub executor: Arc<StepExecutor>,
    pub log_client: Arc<dyn LogClient>,
    pub log_config: LogConfig,
    pub auth_token: Option<String>,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/step/start", post(start_step))
        .route("/step/poll", post(poll_step))
        .route("/step/{id}/output", get(stream_output))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn start_server(
    state: Arc<AppState>,
    bind_host: &str,
    port: u16,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);

    let addr = format!("{bind_host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), HandlerError> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(error_response(StatusCode::UNAUTHORIZED, "invalid auth token")),
        None => Err(error_response(StatusCode::UNAUTHORIZED, "missing auth token")),
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> HandlerError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn executor_error(err: &ExecutorError) -> HandlerError {
    let status = match err {
        ExecutorError::BadRequest(_)
        | ExecutorError::NotStarted(_)
        | ExecutorError::Subscribe(_) => StatusCode::BAD_REQUEST,
        ExecutorError::Canceled | ExecutorError::Delivery(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Request payload for POST /step/start.
#[derive(Debug, Deserialize)]
pub struct StartStepRequest {
    pub step: StepRequest,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub ti_config: Option<TiConfig>,
}

/// Request payload for POST /step/poll.
#[derive(Debug, Deserialize)]
pub struct PollStepRequest {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct StreamOutputQuery {
    /// Byte offset to start reading from.
    #[serde(default)]
    pub offset: Option<usize>,
}

/// Payload of `history` and `output` events.
#[derive(Debug, Serialize)]
struct OutputEventData<'a> {
    offset: usize,
    content: &'a str,
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn start_step(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<StartStepRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    check_auth(&state, &headers)?;

    state
        .executor
        .start_step(
            req.step,
            req.secrets,
            Arc::clone(&state.log_client),
            req.ti_config,
            state.log_config,
        )
        .map_err(|e| {
            warn!(error = %e, "start step rejected");
            executor_error(&e)
        })?;

    Ok(Json(serde_json::json!({})))
}

async fn poll_step(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PollStepRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    check_auth(&state, &headers)?;

    let response = state
        .executor
        .poll_step(&req.id)
        .await
        .map_err(|e| executor_error(&e))?;

    Ok(Json(response))
}

/// GET /step/{id}/output - Stream step output (SSE).
///
/// Sends one `history` event with everything buffered from `offset`, then an
/// `output` event per chunk until the step ends. A client that disconnects
/// only drops its subscription.
async fn stream_output(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<StreamOutputQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, HandlerError> {
    check_auth(&state, &headers)?;

    let cancel = CancellationToken::new();
    let offset = query.offset.unwrap_or(0);
    let output = state
        .executor
        .stream_output(&id, offset, cancel.clone())
        .await
        .map_err(|e| executor_error(&e))?;

    // Dropped with the stream when the client goes away.
    let guard = cancel.drop_guard();

    let stream = stream::unfold(
        (Some(output.history), output.live, offset, guard),
        |(history, mut live, offset, guard)| async move {
            if let Some(history) = history {
                let event = output_event("history", offset, &history);
                let next = offset + history.len();
                return Some((Ok::<_, Infallible>(event), (None, live, next, guard)));
            }

            let chunk = live.recv().await?;
            let event = output_event("output", offset, &chunk);
            let next = offset + chunk.len();
            Some((Ok(event), (None, live, next, guard)))
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn output_event(name: &str, offset: usize, bytes: &[u8]) -> SseEvent {
    let content = String::from_utf8_lossy(bytes);
    let data = OutputEventData {
        offset,
        content: &content,
    };
    SseEvent::default()
        .event(name)
        .data(serde_json::to_string(&data).unwrap_or_default())
}

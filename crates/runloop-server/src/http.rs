use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use runloop_core::{expired_event, RunError, Submission};
use runloop_types::{Message, RunState, StreamEvent, ToolCategory};

use crate::AppState;

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.shutdown_token();
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "runloop server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/breakers/{category}/reset", post(reset_breaker))
        .route("/runs", post(submit_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/events", get(run_events))
        .route("/runs/{id}/stop", post(stop_run))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_REQUEST",
            message: message.into(),
        }
    }

    fn not_found(run_id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "RUN_NOT_FOUND",
            message: format!("run {run_id} not found"),
        }
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        tracing::error!(error = %err, code = err.code(), "request failed");
        let status = if err.is_retryable() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.message, "code": self.code })),
        )
            .into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let queue_depth = match state.scheduler().queue_depth().await {
        Ok(depth) => Some(depth),
        Err(err) => {
            tracing::warn!(error = %err, "queue depth unavailable");
            None
        }
    };
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "worker_id": state.scheduler().worker_id(),
        "uptime_ms": state.uptime_ms(),
        "queue_depth": queue_depth,
        "breakers": state.services().gateway.snapshot(),
    }))
}

async fn reset_breaker(State(state): State<AppState>, Path(category): Path<String>) -> Json<Value> {
    let reset = state.services().gateway.reset(&ToolCategory::new(category.clone()));
    if reset {
        tracing::info!(%category, "circuit breaker reset by operator");
    }
    Json(json!({ "category": category, "reset": reset }))
}

#[derive(Debug, Deserialize)]
struct SubmitRunInput {
    thread_id: String,
    account_id: String,
    idempotency_key: String,
    #[serde(default)]
    prompt: Option<String>,
}

async fn submit_run(
    State(state): State<AppState>,
    Json(input): Json<SubmitRunInput>,
) -> Result<(StatusCode, Json<Submission>), ApiError> {
    for (field, value) in [
        ("thread_id", &input.thread_id),
        ("account_id", &input.account_id),
        ("idempotency_key", &input.idempotency_key),
    ] {
        if value.trim().is_empty() {
            return Err(ApiError::bad_request(format!("{field} is required")));
        }
    }

    let scheduler = state.scheduler();
    // A repeated submission must not append its prompt a second time.
    if let Some(run_id) = scheduler
        .find_submission(&input.account_id, &input.idempotency_key)
        .await?
    {
        return Ok((
            StatusCode::OK,
            Json(Submission {
                run_id,
                duplicate: true,
            }),
        ));
    }

    if let Some(prompt) = input.prompt.as_deref().filter(|p| !p.trim().is_empty()) {
        let message = Message::user(&input.thread_id, prompt);
        let timeout = state.services().config.orchestrator.persistence_timeout();
        match tokio::time::timeout(timeout, state.services().persistence.append_message(&message)).await {
            Ok(result) => result.map_err(RunError::infra)?,
            Err(_) => return Err(RunError::infra("appending prompt timed out").into()),
        }
    }

    let submission = scheduler
        .submit_run(&input.thread_id, &input.account_id, &input.idempotency_key)
        .await?;
    let status = if submission.duplicate {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(submission)))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunState>, ApiError> {
    match state.scheduler().run_state(&run_id).await? {
        Some(run) => Ok(Json(run)),
        None => Err(ApiError::not_found(&run_id)),
    }
}

async fn stop_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.scheduler().run_state(&run_id).await?.is_none() {
        return Err(ApiError::not_found(&run_id));
    }
    let delivered = state.scheduler().stop_run(&run_id).await?;
    Ok(Json(json!({ "run_id": run_id, "delivered": delivered })))
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    /// Last sequence the reader already has; delivery starts after it.
    from: Option<u64>,
}

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .id(event.sequence.to_string())
        .event(event.kind.as_str())
        .data(serde_json::to_string(event).unwrap_or_default())
}

async fn run_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Some(run) = state.scheduler().run_state(&run_id).await? else {
        return Err(ApiError::not_found(&run_id));
    };
    // A reconnecting EventSource knows better than the original query string.
    let after = last_event_id(&headers).or(query.from);
    let events = &state.services().events;
    // A finished run with nothing left in the log has been pruned entirely.
    let source = if run.is_terminal() && events.read(&run_id, None, 1).await?.is_empty() {
        let closing = expired_event(&run_id, after, run.status.as_str());
        futures::stream::once(futures::future::ready(Ok::<_, RunError>(closing))).left_stream()
    } else {
        events.tail(&run_id, after).right_stream()
    };
    let stream = source
        .map(|item| {
            Ok(match item {
                Ok(event) => sse_event(&event),
                Err(err) => Event::default().event("ERROR").data(
                    json!({ "error_code": err.code(), "message": err.to_string() }).to_string(),
                ),
            })
        })
        .take_until(state.shutdown_token().cancelled_owned());
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

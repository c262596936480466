//! REST + SSE surface of the gateway.
//!
//! Schedule CRUD, proactive delivery, stop/status, and a streaming prompt
//! endpoint that fans the orchestrator's turn events out as SSE.  Client
//! disconnects are observed on the response side: when the SSE body is
//! dropped, the fan-out stops but the shared-session turn runs to completion.

mod sse;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use mobyclaw_channels::{AdapterRegistry, ChannelStore};
use mobyclaw_runtime::{Heartbeat, Orchestrator, TurnError};
use mobyclaw_scheduler::{NewSchedule, ScheduleError, ScheduleStatus, ScheduleStore};

pub use sse::stream_event_to_sse;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub schedules: Arc<ScheduleStore>,
    pub channels: Arc<ChannelStore>,
    pub registry: Arc<AdapterRegistry>,
    pub heartbeat: Arc<Heartbeat>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/api/channels", get(channels))
        .route("/api/schedules", get(list_schedules).post(create_schedule))
        .route("/api/schedules/:id", delete(cancel_schedule))
        .route("/api/deliver", post(deliver))
        .route("/api/stop", post(stop))
        .route("/api/heartbeat/trigger", post(trigger_heartbeat))
        .route("/prompt", post(prompt))
        .route("/prompt/stream", post(prompt_stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the shutdown signal flips.
pub async fn serve(
    port: u16,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

// ── error plumbing ─────────────────────────────────────────────────────────────

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, message.into())
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::Invalid(_) => ApiError(StatusCode::BAD_REQUEST, err.to_string()),
            ScheduleError::NotFound(_) | ScheduleError::NotPending(_) => {
                ApiError(StatusCode::NOT_FOUND, err.to_string())
            }
        }
    }
}

// ── plain endpoints ────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.orchestrator.session_store().snapshot();
    let known = state.channels.get_all();
    Json(json!({
        "session_id": snapshot.session_id,
        "session_busy": snapshot.busy,
        "queue_length": snapshot.queue_length,
        "queue_mode": state.orchestrator.queue_mode(),
        "last_activity": snapshot.last_activity,
        "known_channels": known,
        "schedules_pending": state.schedules.pending_count(),
        "uptime": state.started_at.elapsed().as_secs(),
        "channels": known.values().cloned().collect::<Vec<_>>(),
    }))
}

async fn channels(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "channels": state.channels.get_all(),
        "default": state.channels.get_default(),
    }))
}

// ── schedules ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

async fn list_schedules(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some("pending") => Some(ScheduleStatus::Pending),
        Some("delivered") => Some(ScheduleStatus::Delivered),
        Some("cancelled") => Some(ScheduleStatus::Cancelled),
        Some(other) => return Err(bad_request(format!("unknown status {other:?}"))),
    };
    Ok(Json(json!({ "schedules": state.schedules.list(status) })))
}

#[derive(Debug, Deserialize)]
struct CreateScheduleRequest {
    due: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    repeat: Option<String>,
}

async fn create_schedule(
    State(state): State<AppState>,
    Json(req): Json<CreateScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let due: DateTime<Utc> = req
        .due
        .parse()
        .map_err(|_| bad_request(format!("unparseable due time {:?}", req.due)))?;
    let repeat = match req.repeat.as_deref() {
        None => None,
        Some(raw) => Some(raw.parse().map_err(|err| bad_request(format!("{err}")))?),
    };
    let channel = match req.channel {
        Some(channel) => channel,
        None => state
            .channels
            .get_default()
            .ok_or_else(|| bad_request("no channel given and no known default"))?,
    };

    let schedule = state.schedules.create(NewSchedule {
        due,
        message: req.message,
        prompt: req.prompt,
        channel,
        repeat,
    })?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn cancel_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cancelled = state.schedules.cancel(&id)?;
    Ok(Json(serde_json::to_value(cancelled).unwrap_or_default()))
}

// ── delivery & control ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DeliverRequest {
    channel: String,
    message: String,
}

async fn deliver(
    State(state): State<AppState>,
    Json(req): Json<DeliverRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .registry
        .deliver(&req.channel, &req.message)
        .await
        .map_err(|err| ApiError(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({ "status": "delivered", "channel": req.channel })))
}

async fn stop(State(state): State<AppState>) -> Json<serde_json::Value> {
    let outcome = state.orchestrator.stop();
    Json(serde_json::to_value(outcome).unwrap_or_default())
}

async fn trigger_heartbeat(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.heartbeat.tick(true).await {
        Ok(reply) => Ok(Json(json!({ "fired": true, "reply": reply }))),
        Err(err) => Err(ApiError(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
    }
}

// ── prompts ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PromptRequest {
    message: String,
    /// Accepted for API compatibility; the gateway always uses its one
    /// shared session.
    #[serde(default, rename = "session_id")]
    _session_id: Option<String>,
}

async fn prompt(
    State(state): State<AppState>,
    Json(req): Json<PromptRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let response = state
        .orchestrator
        .send("api:http", &req.message)
        .await
        .map_err(|err| ApiError(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({
        "response": response,
        "session_id": state.orchestrator.session_store().session_id(),
    })))
}

async fn prompt_stream(
    State(state): State<AppState>,
    Json(req): Json<PromptRequest>,
) -> Response {
    let (out_tx, out_rx) = mpsc::channel(64);
    let orchestrator = state.orchestrator.clone();
    let message = req.message;

    tokio::spawn(async move {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let turn = {
            let orchestrator = orchestrator.clone();
            let message = message.clone();
            tokio::spawn(
                async move { orchestrator.send_stream("api:http", &message, events_tx).await },
            )
        };

        // Forward turn events until the sender side closes; a failed send
        // means the client left and the rest can be dropped.
        let forwarder = {
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    if out_tx.send(stream_event_to_sse(event)).await.is_err() {
                        break;
                    }
                }
            })
        };

        let result = turn
            .await
            .unwrap_or_else(|err| Err(TurnError::Internal(format!("turn task died: {err}"))));
        let _ = forwarder.await;

        let terminal = match result {
            Ok(text) => axum::response::sse::Event::default().event("done").data(
                json!({
                    "text": text,
                    "session_id": orchestrator.session_store().session_id(),
                })
                .to_string(),
            ),
            Err(err) => {
                warn!(%err, "streamed prompt failed");
                axum::response::sse::Event::default()
                    .event("error")
                    .data(json!({ "message": err.to_string() }).to_string())
            }
        };
        let _ = out_tx.send(terminal).await;
    });

    let stream = futures::stream::unfold(out_rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok::<_, Infallible>(event), rx))
    });

    let mut response = Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    response
}

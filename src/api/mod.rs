//! API Router and Application State (spec.md §6 REST/HTTP surface).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::ai::AiOrchestrator;
use crate::config::Config;
use crate::error::AppError;
use crate::interrupt::InterruptHandler;
use crate::presence::PresenceTracker;
use crate::ratelimit::RateLimiter;
use crate::room::{CreateRoomRequest, RoomStatus, RoomStore, RoomSummary};
use crate::search::SearchBridge;
use crate::signaling::{self, SignalingHub};
use crate::summarization::SummarizationService;
use crate::transcript::ContextManager;
use crate::turn_queue::TurnQueueProcessor;

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub room_store: Arc<RoomStore>,
    pub signaling: Arc<SignalingHub>,
    pub ai: Arc<AiOrchestrator>,
    pub context: Arc<ContextManager>,
    pub turn_queue: Arc<TurnQueueProcessor>,
    pub presence: Arc<PresenceTracker>,
    pub interrupt: Arc<InterruptHandler>,
    pub summarization: Arc<SummarizationService>,
    pub search: Arc<SearchBridge>,
    pub connect_limiter: Arc<RateLimiter<std::net::IpAddr>>,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/rooms", post(create_room).get(list_rooms))
        .route("/rooms/{id}", get(get_room))
        .route("/rooms/{id}/transcript", get(get_transcript))
        .route("/ws/{room_id}", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct ListRoomsQuery {
    status: Option<String>,
}

async fn list_rooms(
    State(state): State<AppState>,
    Query(q): Query<ListRoomsQuery>,
) -> Result<Json<Vec<RoomSummary>>, AppError> {
    let status = match q.status.as_deref() {
        Some("waiting") => Some(RoomStatus::Waiting),
        Some("active") => Some(RoomStatus::Active),
        Some("full") => Some(RoomStatus::Full),
        Some("closed") => Some(RoomStatus::Closed),
        Some(other) if !other.is_empty() => return Err(AppError::InvalidInput(format!("unknown status {other}"))),
        _ => None,
    };
    Ok(Json(state.room_store.list(status).await))
}

#[derive(serde::Serialize)]
struct CreateRoomResponse {
    room: RoomSummary,
}

async fn create_room(
    State(state): State<AppState>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<Json<CreateRoomResponse>, AppError> {
    let owner_id = Uuid::new_v4();
    let handle = state.room_store.create(req, owner_id)?;
    let room = handle.read().await;
    Ok(Json(CreateRoomResponse { room: room.summary() }))
}

async fn get_room(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, AppError> {
    let handle = state.room_store.get(&id).ok_or(AppError::RoomNotFound)?;
    let room = handle.read().await;
    Ok(Json(room.summary()).into_response())
}

#[derive(Debug, Deserialize)]
struct TranscriptQuery {
    #[serde(default = "default_format")]
    format: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    download: bool,
}

fn default_format() -> String {
    "json".into()
}

fn default_limit() -> usize {
    100
}

async fn get_transcript(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<TranscriptQuery>,
) -> Result<Response, AppError> {
    if !state.room_store.exists(&id) {
        return Err(AppError::RoomNotFound);
    }
    let page = state.context.get_entries(&id, q.limit, q.offset, None).await;

    let (content_type, body) = match q.format.as_str() {
        "txt" => (
            "text/plain; charset=utf-8",
            page.entries.iter().map(|e| format!("[{}] {}: {}", e.timestamp, e.speaker, e.content)).collect::<Vec<_>>().join("\n"),
        ),
        "md" => (
            "text/markdown; charset=utf-8",
            page.entries.iter().map(|e| format!("**{}** ({}): {}", e.speaker, e.timestamp, e.content)).collect::<Vec<_>>().join("\n\n"),
        ),
        _ => (
            "application/json",
            serde_json::to_string(&page).unwrap_or_else(|_| "{}".into()),
        ),
    };

    let mut response = Response::builder().header("Content-Type", content_type);
    if q.download {
        let ext = match q.format.as_str() {
            "txt" => "txt",
            "md" => "md",
            _ => "json",
        };
        let filename = sanitize_filename(&id);
        response = response.header("Content-Disposition", format!("attachment; filename=\"transcript-{filename}.{ext}\""));
    }
    Ok(response.body(body.into()).expect("static headers always build a valid response"))
}

fn sanitize_filename(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_').collect()
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    if !state.room_store.exists(&room_id) {
        return Err(AppError::RoomNotFound);
    }
    state.connect_limiter.check(addr.ip()).await?;

    let peer_id = Uuid::new_v4();
    let hub = state.signaling.clone();
    Ok(ws
        .on_upgrade(move |socket| async move {
            signaling::handle_socket(socket, hub, room_id, peer_id).await;
        })
        .into_response())
}

/// Periodic idle-room sweep (closed rooms reaped, empty rooms closed),
/// run as a background task from `main`.
pub async fn run_idle_sweep(state: AppState, interval: Duration, idle_after: chrono::Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for room_id in state.room_store.idle_room_ids(idle_after).await {
            if state.room_store.update_status(&room_id, RoomStatus::Closed).await.is_ok() {
                state.signaling.close_room(&room_id).await;
            }
        }
        state.room_store.reap_closed(idle_after).await;
    }
}

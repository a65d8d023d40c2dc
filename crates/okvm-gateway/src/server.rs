use crate::error::ApiError;
use crate::identity::ClientIdentity;
use crate::ws::ws_handler;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use okvm_core::OkvmError;
use okvm_session::SessionStore;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;

/// Content type of the chat stream: one JSON event per line.
pub const NDJSON: &str = "application/x-ndjson";

/// Shared application state.
pub struct AppState {
    pub sessions: Arc<SessionStore>,
}

/// The HTTP surface over a [`SessionStore`].
pub struct GatewayServer;

impl GatewayServer {
    pub fn build(sessions: Arc<SessionStore>) -> Router {
        let state = Arc::new(AppState { sessions });
        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .route("/api/chat", post(chat_handler))
            .route("/api/chat/abort", post(abort_handler))
            .route(
                "/api/snapshots",
                get(list_snapshots_handler).post(create_snapshot_handler),
            )
            .route("/api/snapshots/restore", post(restore_handler))
            .route("/api/workspace", get(workspace_handler))
            .route("/api/conversations", get(list_conversations_handler))
            .route(
                "/api/conversations/{id}",
                get(load_conversation_handler).delete(delete_conversation_handler),
            )
            .route("/api/session", delete(end_session_handler))
            .route("/api/session/reset", post(reset_handler))
            .with_state(state)
    }
}

type Shared = State<Arc<AppState>>;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Answer in place of the previous turn instead of after it.
    #[serde(default)]
    pub replace_last: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotRequest {
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub snapshot_id: String,
}

async fn health_handler(State(state): Shared) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "okvm",
        "sessions": state.sessions.len(),
    }))
}

/// Runs one turn and streams its events as NDJSON.
///
/// Dropping the connection drops the body, which drops the turn stream and
/// interrupts the turn.
async fn chat_handler(
    State(state): Shared,
    identity: ClientIdentity,
    Json(request): Json<ChatRequest>,
) -> Response {
    let result = start_chat(&state, &identity, request).await;
    identity.reply(result)
}

async fn start_chat(
    state: &AppState,
    identity: &ClientIdentity,
    request: ChatRequest,
) -> Result<Response, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".into()));
    }
    let stream = state
        .sessions
        .start_turn_with(&identity.key, request.message, request.replace_last)
        .await?;
    let body = Body::from_stream(stream.map(|event| Ok::<_, Infallible>(event.to_line())));
    let response = (
        [
            (header::CONTENT_TYPE, NDJSON),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    );
    Ok(response.into_response())
}

async fn abort_handler(State(state): Shared, identity: ClientIdentity) -> Response {
    let aborted = state.sessions.abort_turn(&identity.key);
    identity.respond(Json(json!({ "aborted": aborted })))
}

async fn list_snapshots_handler(State(state): Shared, identity: ClientIdentity) -> Response {
    let result = state
        .sessions
        .list_snapshots(&identity.key)
        .await
        .map(|snapshots| Json(json!({ "snapshots": snapshots })));
    identity.reply(result)
}

async fn create_snapshot_handler(
    State(state): Shared,
    identity: ClientIdentity,
    Json(request): Json<SnapshotRequest>,
) -> Response {
    let result = state
        .sessions
        .snapshot(&identity.key, request.label.as_deref())
        .await
        .map(|snapshot| {
            info!(client_key = %identity.key, snapshot_id = %snapshot.id, "Snapshot created via API");
            (StatusCode::CREATED, Json(snapshot))
        });
    identity.reply(result)
}

async fn restore_handler(
    State(state): Shared,
    identity: ClientIdentity,
    Json(request): Json<RestoreRequest>,
) -> Response {
    let result = state
        .sessions
        .restore(&identity.key, &request.snapshot_id)
        .await
        .map(|snapshot| Json(json!({ "restored": snapshot })));
    identity.reply(result)
}

async fn workspace_handler(State(state): Shared, identity: ClientIdentity) -> Response {
    let result = state.sessions.workspace_state(&identity.key).await.map(Json);
    identity.reply(result)
}

async fn list_conversations_handler(State(state): Shared, identity: ClientIdentity) -> Response {
    let result = state
        .sessions
        .list_conversations(&identity.key)
        .await
        .map(|conversations| Json(json!({ "conversations": conversations })));
    identity.reply(result)
}

/// The full record of one of the caller's conversations.
async fn load_conversation_handler(
    State(state): Shared,
    identity: ClientIdentity,
    Path(id): Path<String>,
) -> Response {
    let result = match state.sessions.load_conversation(&identity.key, &id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(OkvmError::NotFound(format!("conversation {id}"))),
        Err(e) => Err(e),
    };
    identity.reply(result)
}

async fn delete_conversation_handler(
    State(state): Shared,
    identity: ClientIdentity,
    Path(id): Path<String>,
) -> Response {
    let result = match state.sessions.delete_conversation(&identity.key, &id).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(OkvmError::NotFound(format!("conversation {id}"))),
        Err(e) => Err(e),
    };
    identity.reply(result)
}

/// Evicts the caller's session and releases its workspace.
async fn end_session_handler(State(state): Shared, identity: ClientIdentity) -> Response {
    let result = state
        .sessions
        .evict(&identity.key)
        .await
        .map(|ended| Json(json!({ "ended": ended })));
    identity.reply(result)
}

/// Clears history and starts over with an empty workspace.
async fn reset_handler(State(state): Shared, identity: ClientIdentity) -> Response {
    let result = state
        .sessions
        .reset(&identity.key)
        .await
        .map(|()| StatusCode::NO_CONTENT);
    identity.reply(result)
}

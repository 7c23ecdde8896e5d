// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use kuuzuki_core::{run_turn, App, CoreError, InputPart, TurnInput};
use kuuzuki_types::{now_ms, PermissionReply, RevertAnchor};

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/session", get(list_sessions).post(create_session))
        .route("/session/:id", get(get_session).delete(delete_session))
        .route("/session/:id/message", post(post_message))
        .route("/session/:id/abort", post(abort_session))
        .route("/session/:id/share", post(share_session))
        .route("/session/:id/unshare", post(unshare_session))
        .route("/session/:id/revert", post(revert_session))
        .route("/session/:id/unrevert", post(unrevert_session))
        .route("/event", get(events))
        .route("/permission/reply", post(reply_permission))
        .with_state(app)
}

/// Error envelope: `SessionBusy` maps to 409, missing sessions to 404,
/// everything else to 500 with the error text.
fn error_response(err: CoreError) -> Response {
    let (status, message) = match &err {
        CoreError::SessionBusy(_) => (StatusCode::CONFLICT, err.to_string()),
        CoreError::SessionNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        CoreError::Other(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    };
    (status, Json(json!({ "error": message }))).into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": now_ms(),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    #[serde(default)]
    parent_id: Option<String>,
}

async fn create_session(
    State(app): State<Arc<App>>,
    body: Option<Json<CreateSessionRequest>>,
) -> Response {
    let parent = body.and_then(|Json(b)| b.parent_id);
    match app.sessions.create(parent).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_sessions(State(app): State<Arc<App>>) -> Response {
    match app.sessions.list().await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_session(State(app): State<Arc<App>>, Path(id): Path<String>) -> Response {
    match app.sessions.get(&id).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_session(State(app): State<Arc<App>>, Path(id): Path<String>) -> Response {
    match app.sessions.remove(&id).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRequest {
    parts: Vec<InputPart>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    agent: Option<String>,
}

/// Run one turn; responds with the finished assistant message.
async fn post_message(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
    Json(body): Json<MessageRequest>,
) -> Response {
    let input = TurnInput {
        session_id: id,
        parts: body.parts,
        model: body.model,
        mode: body.mode,
        agent: body.agent,
    };
    match run_turn(&app, input).await {
        Ok(message) => Json(message).into_response(),
        Err(e) => error_response(e),
    }
}

async fn abort_session(State(app): State<Arc<App>>, Path(id): Path<String>) -> Response {
    let cancelled = app.cancel(&id).await;
    Json(json!({ "cancelled": cancelled })).into_response()
}

async fn share_session(State(app): State<Arc<App>>, Path(id): Path<String>) -> Response {
    match app.share(&id).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(e),
    }
}

async fn unshare_session(State(app): State<Arc<App>>, Path(id): Path<String>) -> Response {
    match app.unshare(&id).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn revert_session(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
    Json(anchor): Json<RevertAnchor>,
) -> Response {
    match app.sessions.revert(&id, anchor).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(e),
    }
}

async fn unrevert_session(State(app): State<Arc<App>>, Path(id): Path<String>) -> Response {
    match app.sessions.unrevert(&id).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(e),
    }
}

/// Bus event names projected to SSE observers.
fn is_projected(name: &str) -> bool {
    name.starts_with("session.")
        || name.starts_with("message.")
        || name.starts_with("part.")
        || name.starts_with("permission.")
}

/// SSE projection of the bus.  The SSE `id` is the envelope id; clients
/// deduplicate on it after a reconnect.
async fn events(
    State(app): State<Arc<App>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = BroadcastStream::new(app.bus.tap()).filter_map(|item| async move {
        let envelope = item.ok()?;
        if !is_projected(envelope.event.name()) {
            return None;
        }
        let event = SseEvent::default()
            .id(envelope.id.to_string())
            .event(envelope.event.name())
            .json_data(&envelope.event)
            .ok()?;
        Some(Ok(event))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionReplyRequest {
    session_id: String,
    permission_id: String,
    response: PermissionReply,
}

async fn reply_permission(
    State(app): State<Arc<App>>,
    Json(body): Json<PermissionReplyRequest>,
) -> Response {
    debug!(permission = %body.permission_id, "permission reply received");
    let accepted = app
        .permissions
        .respond(&body.session_id, &body.permission_id, body.response)
        .await;
    if accepted {
        Json(json!({ "ok": true })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown or already-resolved permission" })),
        )
            .into_response()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

//! Chat API endpoints — the client-facing surface for agent turns.
//!
//! - `POST /api/chat/send`          — fire-and-forget: returns ids, the
//!   client follows the reply on the socket bus
//! - `POST /api/chat/stream`        — SSE: streams the reply inline
//! - `POST /api/chat/interrupt`     — cancel one reply
//! - `POST /api/chat/interrupt-all` — cancel a whole conversation

use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::stream::Stream;
use serde::Deserialize;
use uuid::Uuid;

use studio_domain::error::Error;
use studio_domain::event::ReplyEvent;

use crate::api::auth::AuthedUser;
use crate::runtime::hub::Subscription;
use crate::runtime::{self, SendRequest};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub uploaded_files: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct InterruptRequest {
    pub reply_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct InterruptAllRequest {
    pub conversation_id: String,
}

impl ChatRequest {
    fn into_send(self) -> SendRequest {
        SendRequest {
            message: self.message,
            conversation_id: self.conversation_id,
            uploaded_files: self.uploaded_files,
        }
    }
}

/// Map a facade error onto the HTTP surface.
fn error_response(e: Error) -> Response {
    let status = match &e {
        Error::Auth(_) => StatusCode::FORBIDDEN,
        Error::SpawnFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::Store(_) | Error::UnknownReply(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/chat/send
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn send(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Json(body): Json<ChatRequest>,
) -> Response {
    match runtime::send(&state, &user_id, body.into_send(), false).await {
        Ok(outcome) => Json(serde_json::json!({
            "conversation_id": outcome.conversation_id,
            "reply_id": outcome.reply_id,
            "status": "processing",
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/chat/stream (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn stream(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Json(body): Json<ChatRequest>,
) -> Response {
    let heartbeat = Duration::from_secs(state.config.stream.heartbeat_secs);

    let outcome = match runtime::send(&state, &user_id, body.into_send(), true).await {
        Ok(o) => o,
        Err(e) => return error_response(e),
    };

    let subscription = match outcome.subscription {
        Some(s) => s,
        None => {
            return error_response(Error::Other("stream subscription missing".into()));
        }
    };

    let start = ReplyEvent::Start {
        conversation_id: outcome.conversation_id.clone(),
        reply_id: outcome.reply_id,
    };

    let mut response = Sse::new(reply_stream(subscription, start, heartbeat)).into_response();
    // Long-poll hygiene: no caching, and no buffering in fronting proxies.
    let headers = response.headers_mut();
    headers.insert("cache-control", HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// Drive the SSE frames from a hub subscription: `start` first, one
/// record per event, a heartbeat per quiet window, ending after `done`.
/// Dropping the stream (client disconnect) just unsubscribes; the reply
/// keeps running.
fn reply_stream(
    mut subscription: Subscription,
    start: ReplyEvent,
    heartbeat: Duration,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        yield Ok(frame(&start));
        loop {
            match tokio::time::timeout(heartbeat, subscription.recv()).await {
                Err(_) => {
                    yield Ok(frame(&ReplyEvent::Heartbeat {}));
                }
                Ok(None) => break,
                Ok(Some(event)) => {
                    let terminal = event.is_terminal();
                    yield Ok(frame(&event));
                    if terminal {
                        break;
                    }
                }
            }
        }
    }
}

/// One SSE record: `event:` is the type tag, `data:` the JSON encoding.
fn frame(event: &ReplyEvent) -> Event {
    Event::default()
        .event(event.kind())
        .data(serde_json::to_string(event).unwrap_or_default())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/chat/interrupt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn interrupt(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Json(body): Json<InterruptRequest>,
) -> Response {
    match runtime::interrupt(&state, &user_id, body.reply_id).await {
        Ok(found) => Json(serde_json::json!({ "success": found })).into_response(),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/chat/interrupt-all
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn interrupt_all(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Json(body): Json<InterruptAllRequest>,
) -> Response {
    match runtime::interrupt_conversation(&state, &user_id, &body.conversation_id).await {
        Ok(cancelled) => Json(serde_json::json!({
            "success": true,
            "cancelled": cancelled,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

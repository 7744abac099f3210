//! Agent callback endpoints.
//!
//! Agent subprocesses post event batches to
//! `POST /trpc/pushMessageToChatAgent` and their completion signal to
//! `POST /trpc/pushFinishedSignalToChatAgent`. Both always answer
//! `{success:true}` unless the shared secret fails: orphan callbacks
//! (unknown reply ids, late batches from killed agents) are logged and
//! swallowed so agents never retry into a wall.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use uuid::Uuid;

use studio_domain::error::Error;
use studio_domain::event::{legacy_events, parse_events, LegacyMessage};

use crate::api::auth::callback_token_ok;
use crate::runtime;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct PushMessageRequest {
    #[serde(rename = "replyId", alias = "reply_id")]
    pub reply_id: Uuid,
    /// Preferred structured form.
    #[serde(default)]
    pub events: Option<Vec<serde_json::Value>>,
    /// Legacy single-message form; synthesizes text/thinking events.
    #[serde(default)]
    pub msg: Option<LegacyMessage>,
}

#[derive(Debug, Deserialize)]
pub struct PushFinishedRequest {
    #[serde(rename = "replyId", alias = "reply_id")]
    pub reply_id: Uuid,
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "success": false, "error": "invalid agent token" })),
    )
        .into_response()
}

fn accepted() -> Response {
    Json(serde_json::json!({ "success": true })).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /trpc/pushMessageToChatAgent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn push_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PushMessageRequest>,
) -> Response {
    if !callback_token_ok(&state, &headers) {
        return unauthorized();
    }

    let events = match (&body.events, &body.msg) {
        (Some(raw), _) => parse_events(raw),
        (None, Some(msg)) => legacy_events(msg),
        (None, None) => {
            tracing::warn!(reply_id = %body.reply_id, "callback without events or msg");
            return accepted();
        }
    };

    match runtime::push_events(&state, body.reply_id, events).await {
        Ok(()) => {}
        Err(Error::UnknownReply(id)) => {
            // Orphan callback: the reply finished, was cancelled, or
            // never existed. Never fatal.
            tracing::warn!(reply_id = %id, "orphan event callback");
        }
        Err(e) => {
            tracing::error!(reply_id = %body.reply_id, error = %e, "event callback failed");
        }
    }
    accepted()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /trpc/pushFinishedSignalToChatAgent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn push_finished(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PushFinishedRequest>,
) -> Response {
    if !callback_token_ok(&state, &headers) {
        return unauthorized();
    }

    match runtime::push_finished(&state, body.reply_id).await {
        Ok(()) => {}
        Err(Error::UnknownReply(id)) => {
            tracing::warn!(reply_id = %id, "orphan finished callback");
        }
        Err(e) => {
            tracing::error!(reply_id = %body.reply_id, error = %e, "finished callback failed");
        }
    }
    accepted()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

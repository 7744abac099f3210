//! Read-back surface: conversations, transcripts, and recent agent
//! sessions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use studio_store::SessionStatus;

use crate::api::auth::AuthedUser;
use crate::state::AppState;

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/conversations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_conversations(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
) -> impl IntoResponse {
    Json(state.conversations.list_for_user(&user_id))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/conversations/:id/messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_messages(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
    Path(conversation_id): Path<String>,
) -> Response {
    let Some(conversation) = state.conversations.get(&conversation_id) else {
        return api_error(StatusCode::NOT_FOUND, "unknown conversation");
    };
    if conversation.user_id != user_id {
        return api_error(StatusCode::FORBIDDEN, "conversation owned by another user");
    }

    match state.messages.read(&conversation_id) {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/replies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct RepliesQuery {
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Status filter, e.g. `running` or `failed`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "d_limit")]
    pub limit: usize,
}

fn d_limit() -> usize {
    50
}

pub async fn list_replies(
    State(state): State<AppState>,
    Query(query): Query<RepliesQuery>,
) -> Response {
    let status = match &query.status {
        Some(raw) => {
            match serde_json::from_value::<SessionStatus>(serde_json::Value::String(raw.clone())) {
                Ok(s) => Some(s),
                Err(_) => {
                    return api_error(
                        StatusCode::BAD_REQUEST,
                        format!("unknown status \"{raw}\""),
                    );
                }
            }
        }
        None => None,
    };

    Json(state.agent_sessions.list(
        query.conversation_id.as_deref(),
        status,
        query.limit,
    ))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "live_agents": state.supervisor.live_count(),
    }))
}

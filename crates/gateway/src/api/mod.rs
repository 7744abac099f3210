pub mod auth;
pub mod callback;
pub mod chat;
pub mod conversations;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::sockets::ws;
use crate::state::AppState;

/// Build the full API router.
///
/// Routes are split into **public** (health, the socket bus, and the
/// trusted agent callbacks, which carry their own shared-secret check)
/// and **protected** (everything client-facing, gated behind the
/// bearer-token middleware).
///
/// `state` is needed to wire up the auth middleware at build time.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        // Health probe
        .route("/api/health", get(conversations::health))
        // Agent callbacks (network-isolated; optional shared secret)
        .route("/trpc/pushMessageToChatAgent", post(callback::push_message))
        .route(
            "/trpc/pushFinishedSignalToChatAgent",
            post(callback::push_finished),
        )
        // Socket bus
        .route("/socket/client", get(ws::client_ws))
        .route("/socket/agent", get(ws::agent_ws));

    let protected = Router::new()
        // Chat (core runtime)
        .route("/api/chat/send", post(chat::send))
        .route("/api/chat/stream", post(chat::stream))
        .route("/api/chat/interrupt", post(chat::interrupt))
        .route("/api/chat/interrupt-all", post(chat::interrupt_all))
        // Conversations & transcripts
        .route("/api/conversations", get(conversations::list_conversations))
        .route(
            "/api/conversations/:id/messages",
            get(conversations::get_messages),
        )
        // Agent session records
        .route("/api/replies", get(conversations::list_replies))
        .layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ));

    public.merge(protected)
}

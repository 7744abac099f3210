//! WebSocket endpoints for the socket bus.
//!
//! Flow (client namespace):
//! 1. Browser connects to `GET /socket/client`
//! 2. Sends `{"event":"joinChatRoom","data":{"conversation_id":"..."}}`
//! 3. Receives `pushReplies` / `pushReplyingState` / `pushFinished` /
//!    `pushCancelled` frames for the joined conversations
//!
//! The agent namespace (`GET /socket/agent`) is reserved: connections
//! only receive server-pushed `interrupt` events.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::sockets::{SocketHub, AGENT_NAMESPACE, CLIENT_NAMESPACE};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct ClientFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// GET /socket/client — upgrade to the client namespace.
pub async fn client_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_connection(socket, state, CLIENT_NAMESPACE))
}

/// GET /socket/agent — upgrade to the (reserved) agent namespace.
pub async fn agent_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_connection(socket, state, AGENT_NAMESPACE))
}

async fn run_connection(socket: WebSocket, state: AppState, namespace: &'static str) {
    let (conn_id, mut outbound) = state.sockets.connect(namespace);
    let (mut sink, mut stream) = socket.split();

    // Writer: pump hub frames to the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    // Reader: handle room membership requests until the peer goes away.
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(conn_id, error = %e, "ignoring malformed socket frame");
                continue;
            }
        };

        let conversation_id = frame
            .data
            .get("conversation_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();

        match frame.event.as_str() {
            "joinChatRoom" if namespace == CLIENT_NAMESPACE => {
                if !conversation_id.is_empty() {
                    state
                        .sockets
                        .join(conn_id, &SocketHub::chat_room(conversation_id));
                }
            }
            "leaveChatRoom" if namespace == CLIENT_NAMESPACE => {
                if !conversation_id.is_empty() {
                    state
                        .sockets
                        .leave(conn_id, &SocketHub::chat_room(conversation_id));
                }
            }
            other => {
                tracing::debug!(conn_id, event = other, "unhandled socket event");
            }
        }
    }

    state.sockets.disconnect(conn_id);
    writer.abort();
}

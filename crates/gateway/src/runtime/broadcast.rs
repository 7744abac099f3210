//! Broadcast adapter — pushes reply traffic onto the socket bus.
//!
//! Every downstream event is attempted on room `chat-{conversation_id}`
//! in the client namespace; terminal transitions additionally fire
//! `pushFinished` / `pushCancelled`, and the agent namespace receives
//! `interrupt` for cancelled replies. All of it is fire-and-forget.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use studio_domain::event::ReplyEvent;

use crate::sockets::{SocketHub, AGENT_NAMESPACE};

pub struct BroadcastAdapter {
    sockets: Arc<SocketHub>,
}

impl BroadcastAdapter {
    pub fn new(sockets: Arc<SocketHub>) -> Self {
        Self { sockets }
    }

    /// `pushReplies {replyId, message}` to the conversation's room.
    pub fn push_reply(&self, conversation_id: &str, reply_id: Uuid, event: &ReplyEvent) {
        self.sockets.emit_to_room(
            &SocketHub::chat_room(conversation_id),
            "pushReplies",
            json!({ "replyId": reply_id, "message": event }),
        );
    }

    /// `pushReplyingState {replying, conversation_id}` at start and end.
    pub fn replying_state(&self, conversation_id: &str, replying: bool) {
        self.sockets.emit_to_room(
            &SocketHub::chat_room(conversation_id),
            "pushReplyingState",
            json!({ "replying": replying, "conversation_id": conversation_id }),
        );
    }

    pub fn finished(&self, conversation_id: &str, reply_id: Uuid) {
        self.sockets.emit_to_room(
            &SocketHub::chat_room(conversation_id),
            "pushFinished",
            json!({ "replyId": reply_id }),
        );
    }

    pub fn cancelled(&self, conversation_id: &str, reply_id: Uuid) {
        self.sockets.emit_to_room(
            &SocketHub::chat_room(conversation_id),
            "pushCancelled",
            json!({ "replyId": reply_id }),
        );
        // Reserved agent-namespace signal.
        self.sockets
            .emit_to_namespace(AGENT_NAMESPACE, "interrupt", json!({ "replyId": reply_id }));
    }
}

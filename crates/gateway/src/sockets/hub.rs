//! In-memory socket connection registry with rooms.
//!
//! Each WebSocket connection registers a bounded sink; emits are
//! fire-and-forget `try_send`s. A connection that cannot keep up simply
//! misses frames — the bus never blocks the event path.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

pub const CLIENT_NAMESPACE: &str = "/client";
pub const AGENT_NAMESPACE: &str = "/agent";

/// Outbound frames per connection before emits start dropping.
const SINK_BUFFER: usize = 128;

struct Connection {
    namespace: &'static str,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    connections: HashMap<u64, Connection>,
    /// Room name → member connection ids (client namespace only).
    rooms: HashMap<String, HashSet<u64>>,
}

#[derive(Default)]
pub struct SocketHub {
    state: RwLock<HubState>,
}

impl SocketHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The room carrying one conversation's reply traffic.
    pub fn chat_room(conversation_id: &str) -> String {
        format!("chat-{conversation_id}")
    }

    /// Register a connection; returns its id and the frame receiver the
    /// WS writer task drains.
    pub fn connect(&self, namespace: &'static str) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SINK_BUFFER);
        let mut state = self.state.write();
        let id = state.next_id;
        state.next_id += 1;
        state.connections.insert(id, Connection { namespace, tx });
        tracing::debug!(conn_id = id, namespace, "socket connected");
        (id, rx)
    }

    pub fn disconnect(&self, conn_id: u64) {
        let mut state = self.state.write();
        state.connections.remove(&conn_id);
        state.rooms.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
        tracing::debug!(conn_id, "socket disconnected");
    }

    pub fn join(&self, conn_id: u64, room: &str) {
        let mut state = self.state.write();
        if !state.connections.contains_key(&conn_id) {
            return;
        }
        state.rooms.entry(room.to_owned()).or_default().insert(conn_id);
    }

    pub fn leave(&self, conn_id: u64, room: &str) {
        let mut state = self.state.write();
        if let Some(members) = state.rooms.get_mut(room) {
            members.remove(&conn_id);
            if members.is_empty() {
                state.rooms.remove(room);
            }
        }
    }

    /// Fire an event at every member of a room. Failures are logged and
    /// never escalated.
    pub fn emit_to_room(&self, room: &str, event: &str, data: Value) {
        let frame = match frame(event, data) {
            Some(f) => f,
            None => return,
        };

        let state = self.state.read();
        let Some(members) = state.rooms.get(room) else {
            return;
        };
        for conn_id in members {
            if let Some(conn) = state.connections.get(conn_id) {
                if conn.tx.try_send(frame.clone()).is_err() {
                    tracing::debug!(conn_id, room, event, "socket emit dropped");
                }
            }
        }
    }

    /// Fire an event at every connection in a namespace.
    pub fn emit_to_namespace(&self, namespace: &str, event: &str, data: Value) {
        let frame = match frame(event, data) {
            Some(f) => f,
            None => return,
        };

        let state = self.state.read();
        for (conn_id, conn) in &state.connections {
            if conn.namespace == namespace && conn.tx.try_send(frame.clone()).is_err() {
                tracing::debug!(conn_id, namespace, event, "socket emit dropped");
            }
        }
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.state
            .read()
            .rooms
            .get(room)
            .map(HashSet::len)
            .unwrap_or(0)
    }
}

fn frame(event: &str, data: Value) -> Option<String> {
    match serde_json::to_string(&serde_json::json!({ "event": event, "data": data })) {
        Ok(f) => Some(f),
        Err(e) => {
            tracing::warn!(event, error = %e, "serializing socket frame failed");
            None
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

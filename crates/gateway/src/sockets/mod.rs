//! Socket bus — the pub/sub layer for chat subscribers and agents.
//!
//! Two namespaces: `/client` (browsers joining `chat-{conversation_id}`
//! rooms) and `/agent` (reserved; receives `interrupt` events).

pub mod hub;
pub mod ws;

pub use hub::{SocketHub, AGENT_NAMESPACE, CLIENT_NAMESPACE};

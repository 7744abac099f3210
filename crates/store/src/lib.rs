//! Durable stores for TestStudio.
//!
//! Everything is file-backed under the configured state path:
//! conversations and plans as JSON snapshots, messages and agent sessions
//! as append-only JSONL. A small in-memory TTL store keeps crash-forensic
//! reply snapshots. Writes are best-effort on the event path — callers
//! log failures and keep streaming.

pub mod agent_sessions;
pub mod conversations;
pub mod forensics;
pub mod messages;
pub mod plans;

pub use agent_sessions::{AgentSession, AgentSessionStore, SessionStatus};
pub use conversations::{Conversation, ConversationStore};
pub use forensics::ForensicsKv;
pub use messages::{MessageStore, StoredMessage};
pub use plans::PlanStore;

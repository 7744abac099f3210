//! In-memory reply state and the reply registry.
//!
//! A [`Reply`] is one agent turn: its status machine, the transcript
//! accumulator, the hidden-tool id set, and the fan-out hub. All mutable
//! state sits behind a per-reply async mutex — `push_events`,
//! `push_finished`, `interrupt`, and the exit watcher for the same reply
//! are mutually exclusive, which keeps tool_result pairing and the
//! single terminal transition race-free.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use studio_store::SessionStatus;

use super::hub::ReplyHub;

/// Mutable per-reply state, guarded by [`Reply::state`].
pub struct ReplyState {
    pub status: SessionStatus,
    /// Full assistant text so far; flushed as one durable message.
    pub accumulated_text: String,
    /// Ids of hidden tool calls, so their paired results are dropped too.
    pub hidden_tool_ids: HashSet<String>,
    /// Set once the single `testcases` event has fired.
    pub testcase_extracted: bool,
    pub cancelled: bool,
}

pub struct Reply {
    pub reply_id: Uuid,
    pub conversation_id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub hub: ReplyHub,
    pub state: AsyncMutex<ReplyState>,
}

/// Registry of all live replies plus the conversation → active-replies
/// index used by "cancel everything in this conversation".
pub struct ReplyRegistry {
    replies: RwLock<HashMap<Uuid, Arc<Reply>>>,
    by_conversation: RwLock<HashMap<String, HashSet<Uuid>>>,
    subscriber_buffer: usize,
}

impl ReplyRegistry {
    pub fn new(subscriber_buffer: usize) -> Self {
        Self {
            replies: RwLock::new(HashMap::new()),
            by_conversation: RwLock::new(HashMap::new()),
            subscriber_buffer,
        }
    }

    /// Mint a reply with a fresh id, initialize its hub and accumulator,
    /// and index it under its conversation.
    pub fn create(&self, conversation_id: &str, user_id: &str) -> Arc<Reply> {
        let reply_id = Uuid::new_v4();
        let reply = Arc::new(Reply {
            reply_id,
            conversation_id: conversation_id.to_owned(),
            user_id: user_id.to_owned(),
            started_at: Utc::now(),
            hub: ReplyHub::new(conversation_id, self.subscriber_buffer),
            state: AsyncMutex::new(ReplyState {
                status: SessionStatus::Starting,
                accumulated_text: String::new(),
                hidden_tool_ids: HashSet::new(),
                testcase_extracted: false,
                cancelled: false,
            }),
        });

        self.replies.write().insert(reply_id, reply.clone());
        self.by_conversation
            .write()
            .entry(conversation_id.to_owned())
            .or_default()
            .insert(reply_id);

        reply
    }

    pub fn get(&self, reply_id: &Uuid) -> Option<Arc<Reply>> {
        self.replies.read().get(reply_id).cloned()
    }

    /// Active reply ids for a conversation (empty when none).
    pub fn in_conversation(&self, conversation_id: &str) -> Vec<Uuid> {
        self.by_conversation
            .read()
            .get(conversation_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Arc<Reply>> {
        self.replies.read().values().cloned().collect()
    }

    /// Drop a reply from the registry and the conversation index. The
    /// index entry is removed entirely once its set empties. Idempotent.
    pub fn remove(&self, reply_id: &Uuid) {
        let removed = self.replies.write().remove(reply_id);
        if let Some(reply) = removed {
            let mut index = self.by_conversation.write();
            if let Some(ids) = index.get_mut(&reply.conversation_id) {
                ids.remove(reply_id);
                if ids.is_empty() {
                    index.remove(&reply.conversation_id);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn indexed_conversations(&self) -> usize {
        self.by_conversation.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_registers_and_indexes() {
        let registry = ReplyRegistry::new(16);
        let reply = registry.create("c1", "u1");

        assert!(registry.get(&reply.reply_id).is_some());
        assert_eq!(registry.in_conversation("c1"), vec![reply.reply_id]);
    }

    #[test]
    fn index_entry_exists_iff_nonempty() {
        let registry = ReplyRegistry::new(16);
        let a = registry.create("c1", "u1");
        let b = registry.create("c1", "u1");

        registry.remove(&a.reply_id);
        assert_eq!(registry.indexed_conversations(), 1);

        registry.remove(&b.reply_id);
        assert_eq!(registry.indexed_conversations(), 0);
        assert!(registry.in_conversation("c1").is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ReplyRegistry::new(16);
        let reply = registry.create("c1", "u1");
        registry.remove(&reply.reply_id);
        registry.remove(&reply.reply_id);
        assert!(registry.get(&reply.reply_id).is_none());
    }

    #[test]
    fn reply_ids_are_unique() {
        let registry = ReplyRegistry::new(16);
        let a = registry.create("c1", "u1");
        let b = registry.create("c1", "u1");
        assert_ne!(a.reply_id, b.reply_id);
        assert_eq!(registry.in_conversation("c1").len(), 2);
    }

    #[tokio::test]
    async fn fresh_reply_state() {
        let registry = ReplyRegistry::new(16);
        let reply = registry.create("c1", "u1");
        let state = reply.state.lock().await;
        assert_eq!(state.status, SessionStatus::Starting);
        assert!(state.accumulated_text.is_empty());
        assert!(!state.testcase_extracted);
        assert!(!state.cancelled);
    }
}

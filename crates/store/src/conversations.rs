//! Conversation store.
//!
//! Persists conversation metadata in `conversations.json` under the state
//! path. Message bodies live in the per-conversation JSONL transcripts
//! (see [`crate::messages`]).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use studio_domain::error::{Error, Result};

/// Length cap applied to titles minted from the opening message.
const TITLE_MAX_CHARS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// File-backed conversation registry.
pub struct ConversationStore {
    path: PathBuf,
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl ConversationStore {
    /// Load or create the store at `state_path/conversations.json`.
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let path = state_path.join("conversations.json");

        let conversations = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(
            conversations = conversations.len(),
            path = %path.display(),
            "conversation store loaded"
        );

        Ok(Self {
            path,
            conversations: RwLock::new(conversations),
        })
    }

    /// Mint a new conversation, titling it from the opening message.
    pub fn create(&self, user_id: &str, opening_message: &str) -> Conversation {
        let now = Utc::now();
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            title: title_from(opening_message),
            created_at: now,
            updated_at: now,
        };

        self.conversations
            .write()
            .insert(conversation.id.clone(), conversation.clone());
        self.flush_logged();
        conversation
    }

    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.conversations.read().get(id).cloned()
    }

    /// Newest-first listing of one user's conversations.
    pub fn list_for_user(&self, user_id: &str) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self
            .conversations
            .read()
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        list
    }

    pub fn touch(&self, id: &str) {
        {
            let mut conversations = self.conversations.write();
            if let Some(c) = conversations.get_mut(id) {
                c.updated_at = Utc::now();
            }
        }
        self.flush_logged();
    }

    /// Persist the snapshot; failures are logged, not raised.
    fn flush_logged(&self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "persisting conversations failed");
        }
    }

    fn flush(&self) -> Result<()> {
        let conversations = self.conversations.read();
        let json = serde_json::to_string_pretty(&*conversations)
            .map_err(|e| Error::Store(format!("serializing conversations: {e}")))?;
        std::fs::write(&self.path, json).map_err(Error::Io)
    }
}

/// First [`TITLE_MAX_CHARS`] characters of the opening message.
fn title_from(message: &str) -> String {
    let trimmed = message.trim();
    trimmed.chars().take(TITLE_MAX_CHARS).collect()
}

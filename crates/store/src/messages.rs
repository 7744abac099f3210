//! Append-only JSONL message transcripts.
//!
//! Each conversation gets `messages/<conversation_id>.jsonl`. Appends
//! dedupe on message id, so flushing the same assistant reply twice
//! (interrupt then finished callback, or a retried finished callback) is
//! silently ignored.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use studio_domain::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

impl StoredMessage {
    pub fn new(id: &str, role: &str, content: &str) -> Self {
        Self {
            id: id.to_owned(),
            role: role.to_owned(),
            content: content.to_owned(),
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

pub struct MessageStore {
    base_dir: PathBuf,
    /// Per-conversation id sets, hydrated lazily from disk.
    seen: Mutex<HashMap<String, HashSet<String>>>,
}

impl MessageStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        let base_dir = state_path.join("messages");
        std::fs::create_dir_all(&base_dir).map_err(Error::Io)?;
        Ok(Self {
            base_dir,
            seen: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, conversation_id: &str) -> PathBuf {
        self.base_dir.join(format!("{conversation_id}.jsonl"))
    }

    /// Append one message. Returns `false` (and writes nothing) when a
    /// message with the same id already exists in the conversation.
    pub fn append(&self, conversation_id: &str, message: &StoredMessage) -> Result<bool> {
        {
            let mut seen = self.seen.lock();
            if !seen.contains_key(conversation_id) {
                let hydrated = self.load_ids(conversation_id);
                seen.insert(conversation_id.to_owned(), hydrated);
            }
            let ids = seen.entry(conversation_id.to_owned()).or_default();
            if !ids.insert(message.id.clone()) {
                tracing::debug!(
                    conversation_id,
                    message_id = %message.id,
                    "duplicate message ignored"
                );
                return Ok(false);
            }
        }

        let json = serde_json::to_string(message)
            .map_err(|e| Error::Store(format!("serializing message: {e}")))?;

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(conversation_id))
            .map_err(Error::Io)?;
        writeln!(file, "{json}").map_err(Error::Io)?;
        Ok(true)
    }

    /// Read back a conversation's messages, oldest first. Malformed lines
    /// are logged and skipped.
    pub fn read(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        let path = self.path_for(conversation_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let mut messages = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredMessage>(line) {
                Ok(m) => messages.push(m),
                Err(e) => {
                    tracing::warn!(
                        conversation_id,
                        error = %e,
                        "skipping malformed message line"
                    );
                }
            }
        }
        Ok(messages)
    }

    fn load_ids(&self, conversation_id: &str) -> HashSet<String> {
        match self.read(conversation_id) {
            Ok(messages) => messages.into_iter().map(|m| m.id).collect(),
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "hydrating message ids failed");
                HashSet::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(dir.path()).unwrap();

        assert!(store
            .append("c1", &StoredMessage::new("m1", "user", "hi"))
            .unwrap());
        assert!(store
            .append("c1", &StoredMessage::new("m2", "assistant", "Hello world"))
            .unwrap());

        let messages = store.read("c1").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].content, "Hello world");
    }

    #[test]
    fn duplicate_ids_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(dir.path()).unwrap();

        assert!(store
            .append("c1", &StoredMessage::new("r1", "assistant", "partial"))
            .unwrap());
        assert!(!store
            .append("c1", &StoredMessage::new("r1", "assistant", "partial again"))
            .unwrap());

        let messages = store.read("c1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "partial");
    }

    #[test]
    fn dedupe_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MessageStore::new(dir.path()).unwrap();
            store
                .append("c1", &StoredMessage::new("r1", "assistant", "one"))
                .unwrap();
        }

        let store = MessageStore::new(dir.path()).unwrap();
        assert!(!store
            .append("c1", &StoredMessage::new("r1", "assistant", "again"))
            .unwrap());
        assert_eq!(store.read("c1").unwrap().len(), 1);
    }

    #[test]
    fn unknown_conversation_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(dir.path()).unwrap();
        assert!(store.read("ghost").unwrap().is_empty());
    }

    #[test]
    fn conversations_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(dir.path()).unwrap();

        store
            .append("c1", &StoredMessage::new("m1", "user", "a"))
            .unwrap();
        // Same message id in a different conversation is a fresh message.
        assert!(store
            .append("c2", &StoredMessage::new("m1", "user", "b"))
            .unwrap());
    }
}

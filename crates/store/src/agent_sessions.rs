//! Agent session records — one durable row per reply.
//!
//! Rows are appended to `agent_sessions.jsonl` and kept in a bounded
//! in-memory ring with an O(1) id index for fast queries. On load, the
//! file is pruned back down to the ring size.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Status only ever moves forward: `starting → running → terminal`.
    pub fn may_advance_to(self, next: SessionStatus) -> bool {
        match self {
            Self::Starting => next != Self::Starting,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub reply_id: Uuid,
    pub conversation_id: String,
    pub user_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentSession {
    pub fn new(reply_id: Uuid, conversation_id: &str, user_id: &str) -> Self {
        Self {
            reply_id,
            conversation_id: conversation_id.to_owned(),
            user_id: user_id.to_owned(),
            status: SessionStatus::Starting,
            pid: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MAX_SESSIONS_IN_MEMORY: usize = 2000;

pub struct AgentSessionStore {
    inner: RwLock<Ring>,
    log_path: PathBuf,
}

/// VecDeque plus a reply_id → logical sequence index; `base_seq` tracks
/// how many entries were popped so the index never needs bulk adjustment.
struct Ring {
    sessions: VecDeque<AgentSession>,
    index: HashMap<Uuid, usize>,
    base_seq: usize,
}

impl Ring {
    fn new(sessions: VecDeque<AgentSession>) -> Self {
        let mut index = HashMap::with_capacity(sessions.len());
        for (i, s) in sessions.iter().enumerate() {
            index.insert(s.reply_id, i);
        }
        Self {
            sessions,
            index,
            base_seq: 0,
        }
    }

    fn get(&self, reply_id: &Uuid) -> Option<&AgentSession> {
        let seq = *self.index.get(reply_id)?;
        self.sessions.get(seq - self.base_seq)
    }

    fn get_mut(&mut self, reply_id: &Uuid) -> Option<&mut AgentSession> {
        let seq = *self.index.get(reply_id)?;
        self.sessions.get_mut(seq - self.base_seq)
    }

    fn push_back(&mut self, session: AgentSession) {
        let seq = self.base_seq + self.sessions.len();
        self.index.insert(session.reply_id, seq);
        self.sessions.push_back(session);
    }

    fn pop_front(&mut self) {
        if let Some(s) = self.sessions.pop_front() {
            self.index.remove(&s.reply_id);
            self.base_seq += 1;
        }
    }
}

impl AgentSessionStore {
    /// Load recent sessions from `state_path/agent_sessions.jsonl`.
    pub fn new(state_path: &Path) -> Self {
        std::fs::create_dir_all(state_path).ok();
        let log_path = state_path.join("agent_sessions.jsonl");
        let (sessions, total_on_disk) = Self::load_recent(&log_path);

        if total_on_disk > sessions.len() {
            tracing::info!(
                kept = sessions.len(),
                pruned = total_on_disk - sessions.len(),
                "pruning agent sessions JSONL on disk"
            );
            Self::rewrite_jsonl(&log_path, &sessions);
        }

        Self {
            inner: RwLock::new(Ring::new(sessions)),
            log_path,
        }
    }

    fn load_recent(path: &Path) -> (VecDeque<AgentSession>, usize) {
        let mut sessions = VecDeque::new();
        let mut total = 0;
        if let Ok(content) = std::fs::read_to_string(path) {
            let lines: Vec<&str> = content.lines().collect();
            total = lines.len();
            for line in lines.iter().rev().take(MAX_SESSIONS_IN_MEMORY) {
                if let Ok(s) = serde_json::from_str::<AgentSession>(line) {
                    sessions.push_front(s);
                }
            }
        }
        (sessions, total)
    }

    fn rewrite_jsonl(path: &Path, sessions: &VecDeque<AgentSession>) {
        let tmp = path.with_extension("jsonl.tmp");
        let mut ok = false;
        if let Ok(mut f) = std::fs::File::create(&tmp) {
            ok = true;
            for s in sessions {
                if let Ok(json) = serde_json::to_string(s) {
                    if writeln!(f, "{json}").is_err() {
                        ok = false;
                        break;
                    }
                }
            }
        }
        if ok {
            let _ = std::fs::rename(&tmp, path);
        } else {
            let _ = std::fs::remove_file(&tmp);
        }
    }

    pub fn insert(&self, session: AgentSession) {
        let mut inner = self.inner.write();
        inner.push_back(session);
        if inner.sessions.len() > MAX_SESSIONS_IN_MEMORY {
            inner.pop_front();
        }
    }

    /// Advance a session's status; regressions are refused and logged.
    /// Terminal transitions stamp `finished_at`.
    pub fn set_status(&self, reply_id: &Uuid, status: SessionStatus) -> bool {
        let mut inner = self.inner.write();
        let Some(session) = inner.get_mut(reply_id) else {
            return false;
        };
        if !session.status.may_advance_to(status) {
            tracing::warn!(
                %reply_id,
                from = ?session.status,
                to = ?status,
                "refusing agent session status regression"
            );
            return false;
        }
        session.status = status;
        if status.is_terminal() {
            session.finished_at = Some(Utc::now());
        }
        true
    }

    pub fn set_pid(&self, reply_id: &Uuid, pid: Option<u32>) {
        let mut inner = self.inner.write();
        if let Some(session) = inner.get_mut(reply_id) {
            session.pid = pid;
        }
    }

    pub fn get(&self, reply_id: &Uuid) -> Option<AgentSession> {
        self.inner.read().get(reply_id).cloned()
    }

    /// Append the row's current state to the JSONL log (one line per
    /// terminal transition in practice). Failures are logged.
    pub fn persist(&self, reply_id: &Uuid) {
        let Some(session) = self.get(reply_id) else {
            return;
        };
        if let Ok(json) = serde_json::to_string(&session) {
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
            {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{json}") {
                        tracing::warn!(%reply_id, error = %e, "persisting agent session failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(%reply_id, error = %e, "opening agent sessions log failed");
                }
            }
        }
    }

    /// Newest-first listing with optional filters.
    pub fn list(
        &self,
        conversation_id: Option<&str>,
        status: Option<SessionStatus>,
        limit: usize,
    ) -> Vec<AgentSession> {
        let inner = self.inner.read();
        inner
            .sessions
            .iter()
            .rev()
            .filter(|s| {
                conversation_id.is_none_or(|c| s.conversation_id == c)
                    && status.is_none_or(|st| s.status == st)
            })
            .take(limit)
            .cloned()
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

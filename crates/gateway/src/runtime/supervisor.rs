//! Agent subprocess supervisor.
//!
//! Spawns one child per reply with its stdio detached (the agent talks
//! back over the HTTP callback, not pipes), tracks it in the process
//! map, and reaps it through a monitor task. Cancellation is
//! cooperative: SIGTERM first, SIGKILL after the configured grace.
//! A child that exits without having posted its finished callback gets a
//! synthetic `failed` terminal.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::process::Command;
use tokio::sync::mpsc;
use uuid::Uuid;

use studio_domain::config::Config;
use studio_domain::error::{Error, Result};
use studio_store::SessionStatus;

use crate::runtime::hub::CloseReason;
use crate::runtime::reply::Reply;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process map
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ChildHandle {
    pid: u32,
    /// Signals the monitor task to SIGKILL the child.
    kill_tx: mpsc::Sender<()>,
    /// Set once a hard kill has been requested.
    killed: AtomicBool,
}

#[derive(Default)]
pub struct Supervisor {
    children: RwLock<HashMap<Uuid, ChildHandle>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff a child exists, has not exited, and has not been killed.
    pub fn is_running(&self, reply_id: &Uuid) -> bool {
        self.children
            .read()
            .get(reply_id)
            .is_some_and(|h| !h.killed.load(Ordering::Acquire))
    }

    pub fn live_count(&self) -> usize {
        self.children.read().len()
    }

    pub fn pid_of(&self, reply_id: &Uuid) -> Option<u32> {
        self.children.read().get(reply_id).map(|h| h.pid)
    }

    /// Ask the child to stop (SIGTERM). Returns false when no child is
    /// tracked for the reply.
    fn soft_kill(&self, reply_id: &Uuid) -> bool {
        let children = self.children.read();
        match children.get(reply_id) {
            Some(handle) => {
                send_sigterm(handle.pid);
                true
            }
            None => false,
        }
    }

    /// Force the child down (SIGKILL via the monitor task).
    fn hard_kill(&self, reply_id: &Uuid) {
        let children = self.children.read();
        if let Some(handle) = children.get(reply_id) {
            handle.killed.store(true, Ordering::Release);
            let _ = handle.kill_tx.try_send(());
        }
    }

    fn hard_kill_all(&self) {
        let children = self.children.read();
        for handle in children.values() {
            handle.killed.store(true, Ordering::Release);
            let _ = handle.kill_tx.try_send(());
        }
    }

    fn register(&self, reply_id: Uuid, handle: ChildHandle) {
        self.children.write().insert(reply_id, handle);
    }

    fn remove(&self, reply_id: &Uuid) {
        self.children.write().remove(reply_id);
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    // Detached children are process-group leaders of nothing special;
    // a plain SIGTERM to the pid is the cooperative stop signal.
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {
    // No SIGTERM equivalent; the hard kill after the grace period is the
    // only stop mechanism.
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spawn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the agent invocation for one reply. The flag set is the wire
/// contract every agent build understands.
pub fn build_agent_command(config: &Config, reply: &Reply, query_json: &str) -> Command {
    let workspace = config
        .agent
        .workspace
        .join(&reply.user_id)
        .join(&reply.conversation_id);
    let api_key = std::env::var(&config.agent.api_key_env).unwrap_or_default();

    let mut cmd = Command::new(&config.agent.program);
    cmd.args(&config.agent.leading_args)
        .arg("--query")
        .arg(query_json)
        .arg("--llmProvider")
        .arg(&config.agent.llm_provider)
        .arg("--modelName")
        .arg(&config.agent.model_name)
        .arg("--apiKey")
        .arg(api_key)
        .arg("--workspace")
        .arg(&workspace)
        .arg("--conversation_id")
        .arg(&reply.conversation_id)
        .arg("--reply_id")
        .arg(reply.reply_id.to_string())
        .arg("--studio_url")
        .arg(&config.server.studio_url)
        .arg("--mode")
        .arg(config.agent.mode.as_flag());

    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    cmd
}

/// Fork the agent for an already-registered reply, attach the exit
/// watcher, and transition the reply to running.
pub async fn launch(state: &AppState, reply: &Arc<Reply>, query_json: &str) -> Result<u32> {
    let workspace = state
        .config
        .agent
        .workspace
        .join(&reply.user_id)
        .join(&reply.conversation_id);
    if let Err(e) = std::fs::create_dir_all(&workspace) {
        tracing::warn!(path = %workspace.display(), error = %e, "creating agent workspace failed");
    }

    let mut cmd = build_agent_command(&state.config, reply, query_json);
    let child = cmd.spawn().map_err(|e| Error::SpawnFailed(e.to_string()))?;
    let pid = child.id().unwrap_or_default();

    let (kill_tx, kill_rx) = mpsc::channel(1);
    state.supervisor.register(
        reply.reply_id,
        ChildHandle {
            pid,
            kill_tx,
            killed: AtomicBool::new(false),
        },
    );

    spawn_monitor(state.clone(), reply.clone(), child, kill_rx);

    {
        let mut st = reply.state.lock().await;
        if st.status == SessionStatus::Starting {
            st.status = SessionStatus::Running;
        }
    }
    state
        .agent_sessions
        .set_status(&reply.reply_id, SessionStatus::Running);
    state.agent_sessions.set_pid(&reply.reply_id, Some(pid));

    tracing::info!(
        reply_id = %reply.reply_id,
        conversation_id = %reply.conversation_id,
        pid,
        "agent spawned"
    );

    Ok(pid)
}

/// The exit watcher: reaps the child and, if no terminal event was
/// observed, schedules the synthetic `failed` terminal before removing
/// the reply from the process map and conversation index.
fn spawn_monitor(
    state: AppState,
    reply: Arc<Reply>,
    mut child: tokio::process::Child,
    mut kill_rx: mpsc::Receiver<()>,
) {
    tokio::spawn(async move {
        let exit_code;
        tokio::select! {
            result = child.wait() => {
                exit_code = result.ok().and_then(|s| s.code());
            }
            _ = kill_rx.recv() => {
                let _ = child.kill().await;
                exit_code = None;
            }
        }

        tracing::debug!(
            reply_id = %reply.reply_id,
            exit_code,
            "agent process exited"
        );

        {
            let mut st = reply.state.lock().await;
            if !st.status.is_terminal() {
                // Exit without a finished callback: synthesize `failed`,
                // preserving the partial transcript.
                st.status = SessionStatus::Failed;
                super::flush_transcript(&state, &reply, &st.accumulated_text);
                state
                    .agent_sessions
                    .set_status(&reply.reply_id, SessionStatus::Failed);
                state.agent_sessions.persist(&reply.reply_id);
                super::snapshot_forensics(&state, &reply, &st);
                reply
                    .hub
                    .close(CloseReason::Failed("agent exited unexpectedly".into()));
                state
                    .broadcast
                    .finished(&reply.conversation_id, reply.reply_id);
                state
                    .broadcast
                    .replying_state(&reply.conversation_id, false);
                tracing::warn!(
                    reply_id = %reply.reply_id,
                    exit_code,
                    "agent exited without finished callback"
                );
            }
        }

        // Removals happen only after the terminal event is scheduled.
        state.supervisor.remove(&reply.reply_id);
        state.replies.remove(&reply.reply_id);
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cancel a reply: flag it, soft-kill the child, schedule the hard kill,
/// inject the `cancelled` terminal, flush the partial transcript.
/// Idempotent: repeat calls on a terminal reply return false.
pub async fn terminate(state: &AppState, reply: &Arc<Reply>) -> bool {
    let grace = Duration::from_secs(state.config.lifecycle.terminate_grace_secs);
    terminate_with_grace(state, reply, Some(grace)).await
}

/// `hard_kill_after = None` leaves the hard kill to the caller
/// (shutdown batches it).
async fn terminate_with_grace(
    state: &AppState,
    reply: &Arc<Reply>,
    hard_kill_after: Option<Duration>,
) -> bool {
    let mut st = reply.state.lock().await;
    if st.cancelled || st.status.is_terminal() {
        return false;
    }
    st.cancelled = true;
    st.status = SessionStatus::Cancelled;

    let had_child = state.supervisor.soft_kill(&reply.reply_id);
    if had_child {
        if let Some(grace) = hard_kill_after {
            let supervisor = state.supervisor.clone();
            let reply_id = reply.reply_id;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                supervisor.hard_kill(&reply_id);
            });
        }
    }

    reply.hub.close(CloseReason::Cancelled);
    super::flush_transcript(state, reply, &st.accumulated_text);
    state
        .agent_sessions
        .set_status(&reply.reply_id, SessionStatus::Cancelled);
    state.agent_sessions.persist(&reply.reply_id);
    super::snapshot_forensics(state, reply, &st);
    state
        .broadcast
        .cancelled(&reply.conversation_id, reply.reply_id);
    state
        .broadcast
        .replying_state(&reply.conversation_id, false);

    tracing::info!(
        reply_id = %reply.reply_id,
        had_child,
        "reply cancelled"
    );
    true
}

/// Cancel every active reply of a conversation. Returns how many were
/// live.
pub async fn terminate_conversation(state: &AppState, conversation_id: &str) -> usize {
    let mut cancelled = 0;
    for reply_id in state.replies.in_conversation(conversation_id) {
        if let Some(reply) = state.replies.get(&reply_id) {
            if terminate(state, &reply).await {
                cancelled += 1;
            }
        }
    }
    cancelled
}

/// Shutdown path: cancel everything, give children the shutdown grace,
/// then hard-kill whatever is left.
pub async fn cleanup(state: &AppState) {
    let replies = state.replies.all();
    if replies.is_empty() {
        return;
    }
    tracing::info!(count = replies.len(), "terminating live agents for shutdown");

    for reply in &replies {
        terminate_with_grace(state, reply, None).await;
    }

    let grace = Duration::from_secs(state.config.lifecycle.shutdown_grace_secs);
    tokio::time::sleep(grace).await;
    state.supervisor.hard_kill_all();
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::hub::ReplyHub;
    use crate::runtime::reply::ReplyState;
    use std::collections::HashSet;

    fn fake_reply() -> Reply {
        Reply {
            reply_id: Uuid::nil(),
            conversation_id: "c1".into(),
            user_id: "u1".into(),
            started_at: chrono::Utc::now(),
            hub: ReplyHub::new("c1", 16),
            state: tokio::sync::Mutex::new(ReplyState {
                status: SessionStatus::Starting,
                accumulated_text: String::new(),
                hidden_tool_ids: HashSet::new(),
                testcase_extracted: false,
                cancelled: false,
            }),
        }
    }

    #[test]
    fn agent_command_carries_the_wire_flags() {
        let mut config = Config::default();
        config.agent.program = "node".into();
        config.agent.leading_args = vec!["agent.js".into()];
        let reply = fake_reply();

        let cmd = build_agent_command(&config, &reply, r#"["ctx","hi"]"#);
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "node");

        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "agent.js");
        for flag in [
            "--query",
            "--llmProvider",
            "--modelName",
            "--apiKey",
            "--workspace",
            "--conversation_id",
            "--reply_id",
            "--studio_url",
            "--mode",
        ] {
            assert!(args.contains(&flag.to_string()), "missing {flag}");
        }

        let mode_idx = args.iter().position(|a| a == "--mode").unwrap();
        assert_eq!(args[mode_idx + 1], "direct");
        let reply_idx = args.iter().position(|a| a == "--reply_id").unwrap();
        assert_eq!(args[reply_idx + 1], Uuid::nil().to_string());
    }

    #[test]
    fn supervisor_tracks_nothing_by_default() {
        let supervisor = Supervisor::new();
        assert!(!supervisor.is_running(&Uuid::new_v4()));
        assert_eq!(supervisor.live_count(), 0);
        assert!(!supervisor.soft_kill(&Uuid::new_v4()));
    }
}

//! Orchestrator runtime — ties the reply registry, subprocess
//! supervisor, tool filter, plan projector, fan-out hubs, and the socket
//! broadcast into the four public operations: [`send`], [`interrupt`],
//! [`push_events`], and [`push_finished`].
//!
//! All mutations of one reply happen under its async mutex, so callback
//! batches, the finished signal, interrupts, and the exit watcher are
//! serialized per reply.

pub mod broadcast;
pub mod filter;
pub mod hub;
pub mod projector;
pub mod reply;
pub mod supervisor;
pub mod testcases;

use uuid::Uuid;

use studio_domain::error::{Error, Result};
use studio_domain::event::{AgentEvent, ReplyEvent};
use studio_store::{AgentSession, ForensicsKv, SessionStatus, StoredMessage};

use crate::state::AppState;

use hub::{CloseReason, Subscription};
use reply::{Reply, ReplyState};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Send
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SendRequest {
    pub message: String,
    /// Absent: mint a conversation titled from the message.
    pub conversation_id: Option<String>,
    /// Workspace-relative names of files uploaded for this turn.
    pub uploaded_files: Vec<String>,
}

pub struct SendOutcome {
    pub conversation_id: String,
    pub reply_id: Uuid,
    /// Present when the caller asked to stream; opened before the
    /// subprocess exists, so no event can be missed.
    pub subscription: Option<Subscription>,
}

/// Start one agent turn: persist the user message, register the reply,
/// open the stream subscription, then spawn the agent.
pub async fn send(
    state: &AppState,
    user_id: &str,
    request: SendRequest,
    subscribe: bool,
) -> Result<SendOutcome> {
    let conversation = match &request.conversation_id {
        Some(id) => {
            let conversation = state
                .conversations
                .get(id)
                .ok_or_else(|| Error::Store(format!("unknown conversation {id}")))?;
            if conversation.user_id != user_id {
                return Err(Error::Auth("conversation owned by another user".into()));
            }
            conversation
        }
        None => state.conversations.create(user_id, &request.message),
    };

    let user_message = StoredMessage::new(&Uuid::new_v4().to_string(), "user", &request.message);
    if let Err(e) = state.messages.append(&conversation.id, &user_message) {
        tracing::warn!(
            conversation_id = %conversation.id,
            error = %e,
            "persisting user message failed"
        );
    }

    let reply = state.replies.create(&conversation.id, user_id);
    state.agent_sessions.insert(AgentSession::new(
        reply.reply_id,
        &conversation.id,
        user_id,
    ));

    // Opened before spawn: the SSE `start` frame always precedes agent
    // output.
    let subscription = subscribe.then(|| reply.hub.subscribe());

    state.broadcast.replying_state(&conversation.id, true);

    let query = build_query(
        user_id,
        &conversation.id,
        &request.message,
        &request.uploaded_files,
    );

    match supervisor::launch(state, &reply, &query).await {
        Ok(_pid) => {
            state.conversations.touch(&conversation.id);
            {
                let st = reply.state.lock().await;
                snapshot_forensics(state, &reply, &st);
            }
            Ok(SendOutcome {
                conversation_id: conversation.id,
                reply_id: reply.reply_id,
                subscription,
            })
        }
        Err(e) => {
            tracing::error!(
                reply_id = %reply.reply_id,
                error = %e,
                "agent spawn failed"
            );
            {
                let mut st = reply.state.lock().await;
                st.status = SessionStatus::Failed;
                snapshot_forensics(state, &reply, &st);
            }
            reply.hub.close(CloseReason::Failed("agent spawn failed".into()));
            state
                .agent_sessions
                .set_status(&reply.reply_id, SessionStatus::Failed);
            state.agent_sessions.persist(&reply.reply_id);
            state.broadcast.replying_state(&conversation.id, false);
            state.replies.remove(&reply.reply_id);
            Err(e)
        }
    }
}

/// The agent query payload: a JSON array whose first element is the
/// system-context block, followed by the raw message.
fn build_query(user_id: &str, conversation_id: &str, message: &str, files: &[String]) -> String {
    let context = format!(
        "[SYSTEM CONTEXT] user={user_id}; conversation={conversation_id}; files=[{}]",
        files.join(", ")
    );
    serde_json::to_string(&serde_json::json!([context, message])).unwrap_or_default()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Interrupt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cancel one reply. Returns whether a live agent turn was found.
pub async fn interrupt(state: &AppState, user_id: &str, reply_id: Uuid) -> Result<bool> {
    let Some(reply) = state.replies.get(&reply_id) else {
        return Ok(false);
    };
    if reply.user_id != user_id {
        return Err(Error::Auth("reply owned by another user".into()));
    }
    Ok(supervisor::terminate(state, &reply).await)
}

/// Cancel every active reply in a conversation the caller owns.
pub async fn interrupt_conversation(
    state: &AppState,
    user_id: &str,
    conversation_id: &str,
) -> Result<usize> {
    if let Some(conversation) = state.conversations.get(conversation_id) {
        if conversation.user_id != user_id {
            return Err(Error::Auth("conversation owned by another user".into()));
        }
    }
    Ok(supervisor::terminate_conversation(state, conversation_id).await)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent callbacks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Route one callback batch through accumulator → filter → projector →
/// hub → broadcast, in order, under the reply lock.
pub async fn push_events(state: &AppState, reply_id: Uuid, events: Vec<AgentEvent>) -> Result<()> {
    let reply = state
        .replies
        .get(&reply_id)
        .ok_or(Error::UnknownReply(reply_id))?;

    let mut st = reply.state.lock().await;
    if st.status.is_terminal() {
        // Late batch from a killed or finished agent: accept and drop.
        tracing::debug!(%reply_id, count = events.len(), "dropping events after terminal");
        return Ok(());
    }

    for event in events {
        match event {
            AgentEvent::Text { content } => {
                st.accumulated_text.push_str(&content);
                emit(state, &reply, ReplyEvent::Chunk { content });

                if !st.testcase_extracted {
                    if let Some(data) = testcases::try_extract(&st.accumulated_text) {
                        st.testcase_extracted = true;
                        emit(state, &reply, ReplyEvent::Testcases { data });
                    }
                }
            }
            AgentEvent::Thinking { content } => {
                emit(state, &reply, ReplyEvent::Thinking { content });
            }
            AgentEvent::ToolCall { id, name, input } => {
                if state.tool_filter.is_hidden(&name) {
                    st.hidden_tool_ids.insert(id);
                    continue;
                }
                let display = state.tool_filter.display(&name).to_owned();
                emit(
                    state,
                    &reply,
                    ReplyEvent::ToolCall {
                        id,
                        name: display,
                        input,
                    },
                );
            }
            AgentEvent::ToolResult {
                id,
                name,
                output,
                success,
            } => {
                if state.tool_filter.is_hidden(&name) || st.hidden_tool_ids.contains(&id) {
                    continue;
                }
                let display = state.tool_filter.display(&name).to_owned();
                emit(
                    state,
                    &reply,
                    ReplyEvent::ToolResult {
                        id,
                        name: display,
                        output,
                        success,
                    },
                );
            }
            AgentEvent::CoordinatorEvent { event_type, data } => {
                state
                    .projector
                    .apply(&reply.conversation_id, &event_type, &data);
                emit(state, &reply, ReplyEvent::CoordinatorEvent { event_type, data });
            }
        }
    }

    Ok(())
}

/// The agent's finished signal: flush the transcript, close the hub with
/// `done`, mark the durable record completed. Duplicate signals are
/// no-ops.
pub async fn push_finished(state: &AppState, reply_id: Uuid) -> Result<()> {
    let reply = state
        .replies
        .get(&reply_id)
        .ok_or(Error::UnknownReply(reply_id))?;

    let mut st = reply.state.lock().await;
    if st.status.is_terminal() {
        tracing::debug!(%reply_id, "duplicate finished signal");
        return Ok(());
    }
    st.status = SessionStatus::Completed;

    flush_transcript(state, &reply, &st.accumulated_text);
    reply.hub.close(CloseReason::Done);
    state
        .agent_sessions
        .set_status(&reply.reply_id, SessionStatus::Completed);
    state.agent_sessions.persist(&reply.reply_id);
    snapshot_forensics(state, &reply, &st);
    state.conversations.touch(&reply.conversation_id);
    state
        .broadcast
        .finished(&reply.conversation_id, reply.reply_id);
    state
        .broadcast
        .replying_state(&reply.conversation_id, false);

    tracing::info!(%reply_id, chars = st.accumulated_text.len(), "reply completed");
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shutdown
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Terminate every live agent and close every hub (reason `cancelled`).
pub async fn shutdown(state: &AppState) {
    supervisor::cleanup(state).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Hub + broadcast, in that order. Broadcast failures never reach the
/// event path.
fn emit(state: &AppState, reply: &Reply, event: ReplyEvent) {
    reply.hub.publish(event.clone());
    state
        .broadcast
        .push_reply(&reply.conversation_id, reply.reply_id, &event);
}

/// Persist the accumulated text as the reply's assistant message. The
/// message id is the reply id, so repeated flushes dedupe. A failure is
/// logged together with the full text so nothing is silently lost.
pub(crate) fn flush_transcript(state: &AppState, reply: &Reply, text: &str) {
    if text.is_empty() {
        return;
    }
    let message = StoredMessage::new(&reply.reply_id.to_string(), "assistant", text);
    if let Err(e) = state.messages.append(&reply.conversation_id, &message) {
        tracing::error!(
            reply_id = %reply.reply_id,
            error = %e,
            accumulated_text = text,
            "persisting assistant message failed"
        );
    }
}

/// Write the reply's `agent:reply:{id}` forensic snapshot (1 h TTL).
pub(crate) fn snapshot_forensics(state: &AppState, reply: &Reply, st: &ReplyState) {
    state.forensics.put(
        &ForensicsKv::reply_key(&reply.reply_id),
        serde_json::json!({
            "reply_id": reply.reply_id,
            "conversation_id": reply.conversation_id,
            "user_id": reply.user_id,
            "status": st.status,
            "accumulated_chars": st.accumulated_text.len(),
            "cancelled": st.cancelled,
            "started_at": reply.started_at.to_rfc3339(),
        }),
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests — end-to-end scenarios against a real AppState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use studio_domain::config::Config;
    use studio_domain::event::CANCELLED_BY_USER;

    /// AppState over temp dirs, with `sh -c <script>` standing in for the
    /// agent executable (the wire flags land in `$0` and beyond, which
    /// the script ignores).
    fn test_state(dir: &Path, script: &str) -> AppState {
        let mut config = Config::default();
        config.storage.state_path = dir.join("state");
        config.agent.workspace = dir.join("workspace");
        config.agent.program = "sh".into();
        config.agent.leading_args = vec!["-c".into(), script.into()];
        config.agent.tools.hidden = vec!["internal_ping".into()];
        config
            .agent
            .tools
            .rename
            .insert("web_search".into(), "Search".into());
        config.lifecycle.shutdown_grace_secs = 0;
        AppState::from_config(Arc::new(config)).expect("test state")
    }

    fn text(content: &str) -> AgentEvent {
        AgentEvent::Text {
            content: content.into(),
        }
    }

    async fn next(sub: &mut Subscription) -> ReplyEvent {
        tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("event within 5s")
            .expect("stream still open")
    }

    #[tokio::test]
    async fn s1_happy_path_text_stream() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), "sleep 30");

        let outcome = send(
            &state,
            "u1",
            SendRequest {
                message: "hi".into(),
                conversation_id: None,
                uploaded_files: vec![],
            },
            true,
        )
        .await
        .unwrap();
        let mut sub = outcome.subscription.unwrap();

        push_events(&state, outcome.reply_id, vec![text("Hello")])
            .await
            .unwrap();
        push_events(&state, outcome.reply_id, vec![text(" world")])
            .await
            .unwrap();
        push_finished(&state, outcome.reply_id).await.unwrap();

        assert_eq!(
            next(&mut sub).await,
            ReplyEvent::Chunk {
                content: "Hello".into()
            }
        );
        assert_eq!(
            next(&mut sub).await,
            ReplyEvent::Chunk {
                content: " world".into()
            }
        );
        match next(&mut sub).await {
            ReplyEvent::Done {
                conversation_id, ..
            } => assert_eq!(conversation_id, outcome.conversation_id),
            other => panic!("expected done, got {other:?}"),
        }
        assert!(sub.recv().await.is_none());

        let messages = state.messages.read(&outcome.conversation_id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, "Hello world");

        let session = state.agent_sessions.get(&outcome.reply_id).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);

        shutdown(&state).await;
    }

    #[tokio::test]
    async fn s2_hidden_tool_pair_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), "sleep 30");

        let outcome = send(
            &state,
            "u1",
            SendRequest {
                message: "go".into(),
                conversation_id: None,
                uploaded_files: vec![],
            },
            true,
        )
        .await
        .unwrap();
        let mut sub = outcome.subscription.unwrap();

        push_events(
            &state,
            outcome.reply_id,
            vec![
                AgentEvent::ToolCall {
                    id: "t1".into(),
                    name: "internal_ping".into(),
                    input: json!({}),
                },
                AgentEvent::ToolCall {
                    id: "t2".into(),
                    name: "fetch".into(),
                    input: json!({}),
                },
                AgentEvent::ToolResult {
                    id: "t1".into(),
                    name: "internal_ping".into(),
                    output: "ok".into(),
                    success: true,
                },
                AgentEvent::ToolResult {
                    id: "t2".into(),
                    name: "fetch".into(),
                    output: "body".into(),
                    success: true,
                },
            ],
        )
        .await
        .unwrap();
        push_finished(&state, outcome.reply_id).await.unwrap();

        match next(&mut sub).await {
            ReplyEvent::ToolCall { id, name, .. } => {
                assert_eq!(id, "t2");
                assert_eq!(name, "fetch");
            }
            other => panic!("expected tool_call t2, got {other:?}"),
        }
        match next(&mut sub).await {
            ReplyEvent::ToolResult { id, output, .. } => {
                assert_eq!(id, "t2");
                assert_eq!(output, "body");
            }
            other => panic!("expected tool_result t2, got {other:?}"),
        }
        assert!(matches!(next(&mut sub).await, ReplyEvent::Done { .. }));

        shutdown(&state).await;
    }

    #[tokio::test]
    async fn tool_display_name_is_substituted() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), "sleep 30");

        let outcome = send(
            &state,
            "u1",
            SendRequest {
                message: "go".into(),
                conversation_id: None,
                uploaded_files: vec![],
            },
            true,
        )
        .await
        .unwrap();
        let mut sub = outcome.subscription.unwrap();

        push_events(
            &state,
            outcome.reply_id,
            vec![AgentEvent::ToolCall {
                id: "t1".into(),
                name: "web_search".into(),
                input: json!({"q": "rust"}),
            }],
        )
        .await
        .unwrap();

        match next(&mut sub).await {
            ReplyEvent::ToolCall { name, .. } => assert_eq!(name, "Search"),
            other => panic!("expected tool_call, got {other:?}"),
        }

        shutdown(&state).await;
    }

    #[tokio::test]
    async fn s3_interrupt_mid_stream() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), "sleep 30");

        let outcome = send(
            &state,
            "u1",
            SendRequest {
                message: "go".into(),
                conversation_id: None,
                uploaded_files: vec![],
            },
            true,
        )
        .await
        .unwrap();
        let mut sub = outcome.subscription.unwrap();

        push_events(&state, outcome.reply_id, vec![text("partial")])
            .await
            .unwrap();

        assert!(interrupt(&state, "u1", outcome.reply_id).await.unwrap());

        assert_eq!(
            next(&mut sub).await,
            ReplyEvent::Chunk {
                content: "partial".into()
            }
        );
        match next(&mut sub).await {
            ReplyEvent::Cancelled { message } => assert_eq!(message, CANCELLED_BY_USER),
            other => panic!("expected cancelled, got {other:?}"),
        }
        assert!(matches!(next(&mut sub).await, ReplyEvent::Done { .. }));

        // The partial transcript is durable.
        let messages = state.messages.read(&outcome.conversation_id).unwrap();
        assert_eq!(messages[1].content, "partial");

        let session = state.agent_sessions.get(&outcome.reply_id).unwrap();
        assert_eq!(session.status, SessionStatus::Cancelled);

        // SIGTERM lands well within the 6 s bound.
        let mut stopped = false;
        for _ in 0..50 {
            if !state.supervisor.is_running(&outcome.reply_id) {
                stopped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(stopped, "agent process still live after interrupt");

        // Idempotent: the reply is already terminal.
        assert!(!interrupt(&state, "u1", outcome.reply_id).await.unwrap_or(true));
    }

    #[tokio::test]
    async fn s6_crash_without_finished_synthesizes_failed() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), "sleep 1");

        let outcome = send(
            &state,
            "u1",
            SendRequest {
                message: "go".into(),
                conversation_id: None,
                uploaded_files: vec![],
            },
            true,
        )
        .await
        .unwrap();
        let mut sub = outcome.subscription.unwrap();

        push_events(&state, outcome.reply_id, vec![text("partial")])
            .await
            .unwrap();

        assert_eq!(
            next(&mut sub).await,
            ReplyEvent::Chunk {
                content: "partial".into()
            }
        );
        match next(&mut sub).await {
            ReplyEvent::Error { message } => assert!(message.contains("exited")),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(matches!(next(&mut sub).await, ReplyEvent::Done { .. }));

        // Exit watcher removed the bookkeeping.
        let mut removed = false;
        for _ in 0..50 {
            if state.replies.get(&outcome.reply_id).is_none() {
                removed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(removed, "reply still registered after exit");
        assert!(!state.supervisor.is_running(&outcome.reply_id));
        assert!(state
            .replies
            .in_conversation(&outcome.conversation_id)
            .is_empty());

        let session = state.agent_sessions.get(&outcome.reply_id).unwrap();
        assert_eq!(session.status, SessionStatus::Failed);

        let messages = state.messages.read(&outcome.conversation_id).unwrap();
        assert_eq!(messages[1].content, "partial");
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.state_path = dir.path().join("state");
        config.agent.workspace = dir.path().join("workspace");
        config.agent.program = "/nonexistent/agent-binary".into();
        let state = AppState::from_config(Arc::new(config)).unwrap();

        let result = send(
            &state,
            "u1",
            SendRequest {
                message: "go".into(),
                conversation_id: None,
                uploaded_files: vec![],
            },
            false,
        )
        .await;

        assert!(matches!(result, Err(Error::SpawnFailed(_))));
        assert!(state.replies.all().is_empty());

        let sessions = state
            .agent_sessions
            .list(None, Some(SessionStatus::Failed), 10);
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn interrupt_requires_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), "sleep 30");

        let outcome = send(
            &state,
            "u1",
            SendRequest {
                message: "go".into(),
                conversation_id: None,
                uploaded_files: vec![],
            },
            false,
        )
        .await
        .unwrap();

        let denied = interrupt(&state, "mallory", outcome.reply_id).await;
        assert!(matches!(denied, Err(Error::Auth(_))));

        // The reply is untouched.
        assert!(state.supervisor.is_running(&outcome.reply_id));

        shutdown(&state).await;
    }

    #[tokio::test]
    async fn interrupt_unknown_reply_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), "sleep 30");
        assert!(!interrupt(&state, "u1", Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn push_events_to_unknown_reply_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), "sleep 30");
        let result = push_events(&state, Uuid::new_v4(), vec![text("x")]).await;
        assert!(matches!(result, Err(Error::UnknownReply(_))));
    }

    #[tokio::test]
    async fn events_after_terminal_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), "sleep 30");

        let outcome = send(
            &state,
            "u1",
            SendRequest {
                message: "go".into(),
                conversation_id: None,
                uploaded_files: vec![],
            },
            true,
        )
        .await
        .unwrap();
        let mut sub = outcome.subscription.unwrap();

        push_finished(&state, outcome.reply_id).await.unwrap();
        // Orphan batch after the terminal: accepted, dropped.
        push_events(&state, outcome.reply_id, vec![text("late")])
            .await
            .unwrap();
        // Duplicate finished: no-op.
        push_finished(&state, outcome.reply_id).await.unwrap();

        assert!(matches!(next(&mut sub).await, ReplyEvent::Done { .. }));
        assert!(sub.recv().await.is_none());

        assert!(state
            .messages
            .read(&outcome.conversation_id)
            .unwrap()
            .iter()
            .all(|m| m.content != "late"));

        shutdown(&state).await;
    }

    #[tokio::test]
    async fn testcases_event_fires_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), "sleep 30");

        let outcome = send(
            &state,
            "u1",
            SendRequest {
                message: "generate".into(),
                conversation_id: None,
                uploaded_files: vec![],
            },
            true,
        )
        .await
        .unwrap();
        let mut sub = outcome.subscription.unwrap();

        let doc = json!({
            "interface_name": "Login",
            "testcases": [{"name": "case one"}, {"name": "case two"}]
        });
        let payload = format!("Suite ready, padding to clear the length gate: {doc}");

        push_events(&state, outcome.reply_id, vec![text(&payload)])
            .await
            .unwrap();
        // More text afterwards must not re-fire the extraction.
        push_events(&state, outcome.reply_id, vec![text(" trailing notes")])
            .await
            .unwrap();
        push_finished(&state, outcome.reply_id).await.unwrap();

        assert!(matches!(next(&mut sub).await, ReplyEvent::Chunk { .. }));
        match next(&mut sub).await {
            ReplyEvent::Testcases { data } => {
                assert_eq!(data.count, 2);
                assert_eq!(data.status, "success");
            }
            other => panic!("expected testcases, got {other:?}"),
        }
        assert!(matches!(next(&mut sub).await, ReplyEvent::Chunk { .. }));
        assert!(matches!(next(&mut sub).await, ReplyEvent::Done { .. }));

        shutdown(&state).await;
    }

    #[tokio::test]
    async fn coordinator_events_project_and_fan_out() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), "sleep 30");

        let outcome = send(
            &state,
            "u1",
            SendRequest {
                message: "plan".into(),
                conversation_id: None,
                uploaded_files: vec![],
            },
            true,
        )
        .await
        .unwrap();
        let mut sub = outcome.subscription.unwrap();

        push_events(
            &state,
            outcome.reply_id,
            vec![AgentEvent::CoordinatorEvent {
                event_type: "plan_created".into(),
                data: json!({"plan": {"objective": "O", "phases": [{"phase": 1}]}}),
            }],
        )
        .await
        .unwrap();

        match next(&mut sub).await {
            ReplyEvent::CoordinatorEvent { event_type, .. } => {
                assert_eq!(event_type, "plan_created");
            }
            other => panic!("expected coordinator_event, got {other:?}"),
        }

        let plan = state.plans.get(&outcome.conversation_id).unwrap();
        assert_eq!(plan.objective, "O");

        shutdown(&state).await;
    }

    #[tokio::test]
    async fn interrupt_conversation_cancels_all_active() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), "sleep 30");

        let first = send(
            &state,
            "u1",
            SendRequest {
                message: "one".into(),
                conversation_id: None,
                uploaded_files: vec![],
            },
            false,
        )
        .await
        .unwrap();
        let second = send(
            &state,
            "u1",
            SendRequest {
                message: "two".into(),
                conversation_id: Some(first.conversation_id.clone()),
                uploaded_files: vec![],
            },
            false,
        )
        .await
        .unwrap();

        let cancelled = interrupt_conversation(&state, "u1", &first.conversation_id)
            .await
            .unwrap();
        assert_eq!(cancelled, 2);

        for reply_id in [first.reply_id, second.reply_id] {
            let session = state.agent_sessions.get(&reply_id).unwrap();
            assert_eq!(session.status, SessionStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn send_to_foreign_conversation_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), "sleep 30");

        let outcome = send(
            &state,
            "u1",
            SendRequest {
                message: "mine".into(),
                conversation_id: None,
                uploaded_files: vec![],
            },
            false,
        )
        .await
        .unwrap();
        shutdown(&state).await;

        let denied = send(
            &state,
            "mallory",
            SendRequest {
                message: "yours".into(),
                conversation_id: Some(outcome.conversation_id),
                uploaded_files: vec![],
            },
            false,
        )
        .await;
        assert!(matches!(denied, Err(Error::Auth(_))));
    }

    #[test]
    fn query_payload_shape() {
        let query = build_query("u1", "c1", "run the suite", &["spec.pdf".into()]);
        let value: serde_json::Value = serde_json::from_str(&query).unwrap();
        let array = value.as_array().unwrap();
        assert_eq!(array.len(), 2);
        let context = array[0].as_str().unwrap();
        assert!(context.starts_with("[SYSTEM CONTEXT]"));
        assert!(context.contains("user=u1"));
        assert!(context.contains("conversation=c1"));
        assert!(context.contains("spec.pdf"));
        assert_eq!(array[1], "run the suite");
    }
}

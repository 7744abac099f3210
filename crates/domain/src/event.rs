//! Agent event model.
//!
//! Two layers: [`AgentEvent`] is what agent subprocesses post to the
//! callback endpoint, [`ReplyEvent`] is what the orchestrator fans out to
//! SSE streams and socket subscribers after filtering and accumulation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Message injected into a cancelled reply's stream.
pub const CANCELLED_BY_USER: &str = "用户终止了请求";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One event in an agent callback batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Text {
        content: String,
    },
    /// Reasoning trace; passed through, never accumulated.
    Thinking {
        content: String,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        id: String,
        name: String,
        #[serde(default)]
        output: String,
        #[serde(default)]
        success: bool,
    },
    CoordinatorEvent {
        event_type: String,
        #[serde(default)]
        data: Value,
    },
}

/// Parse a raw callback batch. Malformed items are logged and skipped;
/// parsing never aborts the batch.
pub fn parse_events(raw: &[Value]) -> Vec<AgentEvent> {
    let mut events = Vec::with_capacity(raw.len());
    for item in raw {
        match serde_json::from_value::<AgentEvent>(item.clone()) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!(error = %e, event = %item, "skipping malformed agent event");
            }
        }
    }
    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Legacy message form
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The pre-batch callback shape: a single message whose content is either
/// a plain string or an array of text/thinking blocks.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyMessage {
    pub content: LegacyContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LegacyContent {
    Text(String),
    Blocks(Vec<LegacyBlock>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thinking: Option<String>,
}

/// Synthesize structured events from a legacy message. Unknown block
/// types are logged and skipped.
pub fn legacy_events(msg: &LegacyMessage) -> Vec<AgentEvent> {
    match &msg.content {
        LegacyContent::Text(text) => vec![AgentEvent::Text {
            content: text.clone(),
        }],
        LegacyContent::Blocks(blocks) => {
            let mut events = Vec::with_capacity(blocks.len());
            for block in blocks {
                match block.block_type.as_str() {
                    "text" => events.push(AgentEvent::Text {
                        content: block.text.clone().unwrap_or_default(),
                    }),
                    "thinking" => events.push(AgentEvent::Thinking {
                        content: block.thinking.clone().unwrap_or_default(),
                    }),
                    other => {
                        tracing::warn!(block_type = other, "skipping unknown legacy block");
                    }
                }
            }
            events
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Downstream events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extracted testcase payload carried by [`ReplyEvent::Testcases`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestcaseData {
    pub status: String,
    pub count: usize,
    pub testcases: Vec<Value>,
}

/// An event fanned out to a reply's subscribers. The serde tag doubles as
/// the SSE `event:` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyEvent {
    Start {
        conversation_id: String,
        reply_id: Uuid,
    },
    /// Text delta (not the accumulated total).
    Chunk {
        content: String,
    },
    Thinking {
        content: String,
    },
    /// Tool call with the display name already substituted.
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        name: String,
        output: String,
        success: bool,
    },
    CoordinatorEvent {
        event_type: String,
        data: Value,
    },
    Testcases {
        data: TestcaseData,
    },
    Heartbeat {},
    Cancelled {
        message: String,
    },
    Error {
        message: String,
    },
    Done {
        conversation_id: String,
        timestamp: String,
    },
}

impl ReplyEvent {
    /// The SSE `event:` name for this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Chunk { .. } => "chunk",
            Self::Thinking { .. } => "thinking",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::CoordinatorEvent { .. } => "coordinator_event",
            Self::Testcases { .. } => "testcases",
            Self::Heartbeat {} => "heartbeat",
            Self::Cancelled { .. } => "cancelled",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    /// `done` ends every subscription; everything else is mid-stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    pub fn done_now(conversation_id: &str) -> Self {
        Self::Done {
            conversation_id: conversation_id.to_owned(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_structured_batch() {
        let raw = vec![
            json!({"type": "text", "content": "Hello"}),
            json!({"type": "tool_call", "id": "t1", "name": "fetch", "input": {"url": "x"}}),
            json!({"type": "tool_result", "id": "t1", "name": "fetch", "output": "body", "success": true}),
            json!({"type": "coordinator_event", "event_type": "phase_started", "data": {"phase": 1}}),
        ];
        let events = parse_events(&raw);
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            AgentEvent::Text {
                content: "Hello".into()
            }
        );
        match &events[1] {
            AgentEvent::ToolCall { id, name, .. } => {
                assert_eq!(id, "t1");
                assert_eq!(name, "fetch");
            }
            other => panic!("expected tool_call, got {other:?}"),
        }
    }

    #[test]
    fn malformed_items_are_skipped_not_fatal() {
        let raw = vec![
            json!({"type": "warp_core_breach"}),
            json!({"type": "text", "content": "ok"}),
            json!(42),
        ];
        let events = parse_events(&raw);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            AgentEvent::Text {
                content: "ok".into()
            }
        );
    }

    #[test]
    fn tool_call_input_defaults_to_null() {
        let raw = vec![json!({"type": "tool_call", "id": "t1", "name": "fetch"})];
        let events = parse_events(&raw);
        assert_eq!(
            events[0],
            AgentEvent::ToolCall {
                id: "t1".into(),
                name: "fetch".into(),
                input: Value::Null,
            }
        );
    }

    #[test]
    fn legacy_string_content() {
        let msg: LegacyMessage = serde_json::from_value(json!({"content": "hi"})).unwrap();
        let events = legacy_events(&msg);
        assert_eq!(events, vec![AgentEvent::Text { content: "hi".into() }]);
    }

    #[test]
    fn legacy_block_content() {
        let msg: LegacyMessage = serde_json::from_value(json!({
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "answer"},
                {"type": "image", "source": "ignored"}
            ]
        }))
        .unwrap();
        let events = legacy_events(&msg);
        assert_eq!(
            events,
            vec![
                AgentEvent::Thinking {
                    content: "hmm".into()
                },
                AgentEvent::Text {
                    content: "answer".into()
                },
            ]
        );
    }

    #[test]
    fn reply_event_kinds_match_wire_names() {
        let done = ReplyEvent::done_now("c1");
        assert_eq!(done.kind(), "done");
        assert!(done.is_terminal());

        let chunk = ReplyEvent::Chunk {
            content: "x".into(),
        };
        assert_eq!(chunk.kind(), "chunk");
        assert!(!chunk.is_terminal());
    }

    #[test]
    fn reply_event_serializes_with_type_tag() {
        let event = ReplyEvent::Chunk {
            content: "Hello".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"type": "chunk", "content": "Hello"}));
    }

    #[test]
    fn heartbeat_serializes_to_bare_tag() {
        let value = serde_json::to_value(ReplyEvent::Heartbeat {}).unwrap();
        assert_eq!(value, json!({"type": "heartbeat"}));
    }
}

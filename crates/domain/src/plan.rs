//! Coordinator plan state — the persisted projection of coordinator
//! events for one conversation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Running,
    Completed,
    Failed,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One plan row, keyed by conversation (re-running a plan overwrites it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorPlan {
    pub conversation_id: String,
    pub objective: String,
    /// The original plan document, kept opaque.
    pub plan: Value,
    pub active_phase: Option<i64>,
    /// Strictly growing; phases are never removed.
    pub completed_phases: Vec<i64>,
    /// `"phase_{n}"` → evaluation payload.
    #[serde(default)]
    pub phase_outputs: serde_json::Map<String, Value>,
    pub status: PlanStatus,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl CoordinatorPlan {
    pub fn new(conversation_id: &str, objective: String, plan: Value) -> Self {
        Self {
            conversation_id: conversation_id.to_owned(),
            objective,
            plan,
            active_phase: None,
            completed_phases: Vec::new(),
            phase_outputs: serde_json::Map::new(),
            status: PlanStatus::Running,
            updated_at: chrono::Utc::now(),
        }
    }
}

/// Key under which a phase's evaluation is stored in `phase_outputs`.
pub fn phase_output_key(phase: i64) -> String {
    format!("phase_{phase}")
}

//! Plan state projector.
//!
//! Maps coordinator events onto the persisted plan row for a
//! conversation. Every update is a monotonic, idempotent re-application:
//! `completed_phases` only grows, re-delivered events converge to the
//! same row. Persistence failures are logged and absorbed — the event
//! stream must keep flowing.

use std::sync::Arc;

use serde_json::Value;

use studio_domain::plan::{phase_output_key, CoordinatorPlan, PlanStatus};
use studio_store::PlanStore;

pub struct PlanProjector {
    plans: Arc<PlanStore>,
}

impl PlanProjector {
    pub fn new(plans: Arc<PlanStore>) -> Self {
        Self { plans }
    }

    /// Apply one coordinator event to the conversation's plan row.
    pub fn apply(&self, conversation_id: &str, event_type: &str, data: &Value) {
        match event_type {
            "plan_created" => self.on_plan_created(conversation_id, data),
            "phase_started" => self.on_phase_started(conversation_id, data),
            "phase_completed" => self.on_phase_completed(conversation_id, data),
            "task_completed" => self.set_status(conversation_id, PlanStatus::Completed),
            "task_failed" | "execution_failed" => {
                self.set_status(conversation_id, PlanStatus::Failed)
            }
            other => {
                tracing::debug!(conversation_id, event_type = other, "unhandled coordinator event");
            }
        }
    }

    fn on_plan_created(&self, conversation_id: &str, data: &Value) {
        let Some(plan_doc) = data.get("plan") else {
            tracing::warn!(conversation_id, "plan_created without a plan document");
            return;
        };
        let objective = plan_doc
            .get("objective")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        let row = CoordinatorPlan::new(conversation_id, objective, plan_doc.clone());
        if let Err(e) = self.plans.upsert(row) {
            tracing::warn!(conversation_id, error = %e, "persisting plan_created failed");
        }
    }

    fn on_phase_started(&self, conversation_id: &str, data: &Value) {
        let Some(phase) = data.get("phase").and_then(Value::as_i64) else {
            tracing::warn!(conversation_id, "phase_started without a phase number");
            return;
        };

        match self.plans.update(conversation_id, |plan| {
            plan.active_phase = Some(phase);
            plan.status = PlanStatus::Running;
        }) {
            Ok(true) => {}
            Ok(false) => {
                // Out-of-order: phase event before plan_created.
                tracing::warn!(conversation_id, phase, "phase_started before plan_created, dropped");
            }
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "persisting phase_started failed");
            }
        }
    }

    fn on_phase_completed(&self, conversation_id: &str, data: &Value) {
        let Some(phase) = data.get("phase").and_then(Value::as_i64) else {
            tracing::warn!(conversation_id, "phase_completed without a phase number");
            return;
        };
        let evaluation = data.get("evaluation").cloned();

        match self.plans.update(conversation_id, |plan| {
            if !plan.completed_phases.contains(&phase) {
                plan.completed_phases.push(phase);
            }
            if let Some(eval) = evaluation {
                plan.phase_outputs.insert(phase_output_key(phase), eval);
            }
            if plan.active_phase == Some(phase) {
                plan.active_phase = None;
            }
        }) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(conversation_id, phase, "phase_completed before plan_created, dropped");
            }
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "persisting phase_completed failed");
            }
        }
    }

    fn set_status(&self, conversation_id: &str, status: PlanStatus) {
        match self.plans.update(conversation_id, |plan| {
            plan.status = status;
        }) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(conversation_id, ?status, "status event before plan_created, dropped");
            }
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "persisting plan status failed");
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

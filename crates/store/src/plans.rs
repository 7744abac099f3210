//! Coordinator plan store.
//!
//! One plan row per conversation, persisted as a JSON snapshot in
//! `coordinator_plans.json`. The projector (gateway runtime) owns all
//! state transitions; this store is plain CRUD.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use studio_domain::error::{Error, Result};
use studio_domain::plan::CoordinatorPlan;

pub struct PlanStore {
    path: PathBuf,
    plans: RwLock<HashMap<String, CoordinatorPlan>>,
}

impl PlanStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let path = state_path.join("coordinator_plans.json");

        let plans = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(plans = plans.len(), path = %path.display(), "plan store loaded");

        Ok(Self {
            path,
            plans: RwLock::new(plans),
        })
    }

    pub fn get(&self, conversation_id: &str) -> Option<CoordinatorPlan> {
        self.plans.read().get(conversation_id).cloned()
    }

    /// Insert or replace the conversation's plan row and persist.
    pub fn upsert(&self, plan: CoordinatorPlan) -> Result<()> {
        self.plans
            .write()
            .insert(plan.conversation_id.clone(), plan);
        self.flush()
    }

    /// Mutate the conversation's plan row in place and persist. Returns
    /// `false` when no row exists (the closure is not invoked).
    pub fn update<F>(&self, conversation_id: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut CoordinatorPlan),
    {
        {
            let mut plans = self.plans.write();
            let Some(plan) = plans.get_mut(conversation_id) else {
                return Ok(false);
            };
            f(plan);
            plan.updated_at = chrono::Utc::now();
        }
        self.flush()?;
        Ok(true)
    }

    fn flush(&self) -> Result<()> {
        let plans = self.plans.read();
        let json = serde_json::to_string_pretty(&*plans)
            .map_err(|e| Error::Store(format!("serializing plans: {e}")))?;
        std::fs::write(&self.path, json).map_err(Error::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use studio_domain::plan::PlanStatus;

    #[test]
    fn upsert_get_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path()).unwrap();

        store
            .upsert(CoordinatorPlan::new("c1", "O".into(), json!({"phases": []})))
            .unwrap();

        let updated = store
            .update("c1", |p| {
                p.active_phase = Some(1);
            })
            .unwrap();
        assert!(updated);

        let plan = store.get("c1").unwrap();
        assert_eq!(plan.active_phase, Some(1));
        assert_eq!(plan.status, PlanStatus::Running);
    }

    #[test]
    fn update_without_row_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path()).unwrap();
        let updated = store.update("ghost", |_| panic!("must not run")).unwrap();
        assert!(!updated);
    }

    #[test]
    fn upsert_overwrites_previous_plan() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path()).unwrap();

        let mut first = CoordinatorPlan::new("c1", "old".into(), json!({}));
        first.completed_phases = vec![1, 2];
        store.upsert(first).unwrap();

        store
            .upsert(CoordinatorPlan::new("c1", "new".into(), json!({})))
            .unwrap();

        let plan = store.get("c1").unwrap();
        assert_eq!(plan.objective, "new");
        assert!(plan.completed_phases.is_empty());
    }

    #[test]
    fn survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = PlanStore::new(dir.path()).unwrap();
            store
                .upsert(CoordinatorPlan::new("c1", "O".into(), json!({"phases": [1]})))
                .unwrap();
        }
        let store = PlanStore::new(dir.path()).unwrap();
        assert_eq!(store.get("c1").unwrap().objective, "O");
    }
}

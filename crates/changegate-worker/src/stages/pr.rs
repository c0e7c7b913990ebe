// crates/changegate-worker/src/stages/pr.rs
// ============================================================================
// Module: Pr Stage
// Description: The final gated stage; records the pull request opened by
//              the apply_patches job as an artifact for audit/approval.
// Purpose: Give the "pr" gate something to show a human before `done`.
// Dependencies: changegate-core, async-trait
// ============================================================================

//! ## Overview
//! By the time the `pr` stage runs, `apply_patches` has already opened the
//! pull request (the `applying_patches -> pr_open` transition requires
//! `result.prNumber` on that job's completion). [`PrWorker`] does not open a
//! second pull request; it reads the opened PR's number/url back out of the
//! workflow's event history and records a
//! [`changegate_core::model::ArtifactKind::PrV1`] artifact so the stage is
//! still gated behind an ordinary human `E_STAGE_APPROVED{stage: "pr"}`
//! before `done`.

use async_trait::async_trait;
use changegate_core::identifiers::StageName;
use changegate_core::interfaces::Store;
use changegate_core::model::ArtifactKind;
use serde_json::Value;
use serde_json::json;

use crate::stage_worker::StageInputs;
use crate::stage_worker::StageWorker;

/// Records the already-opened pull request as the pr stage's artifact.
pub struct PrWorker {
    /// The store, for reading back the `apply_patches` completion event.
    store: std::sync::Arc<dyn Store>,
}

impl PrWorker {
    /// Creates a pr-stage worker bound to `store`.
    #[must_use]
    pub fn new(store: std::sync::Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StageWorker for PrWorker {
    fn stage(&self) -> StageName {
        StageName::Pr
    }

    fn artifact_kind(&self) -> ArtifactKind {
        ArtifactKind::PrV1
    }

    async fn process_artifact(&self, inputs: &StageInputs) -> Result<Value, String> {
        let events = self.store.list_events(&inputs.workflow.id).await.map_err(|err| err.to_string())?;
        let opened = events
            .iter()
            .rev()
            .find(|event| event.event_type == "worker.apply_patches.completed")
            .ok_or_else(|| "no apply_patches completion event recorded for this workflow".to_owned())?;

        let pr_number = opened.payload.get("prNumber").cloned().ok_or_else(|| "apply_patches event missing prNumber".to_owned())?;
        let pr_url = opened.payload.get("prUrl").cloned().unwrap_or(Value::Null);

        Ok(json!({ "prNumber": pr_number, "prUrl": pr_url }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use changegate_core::identifiers::ArtifactId;
    use changegate_core::identifiers::EventId;
    use changegate_core::identifiers::PatchSetId;
    use changegate_core::identifiers::WorkflowId;
    use changegate_core::interfaces::StoreError;
    use changegate_core::model::Approval;
    use changegate_core::model::Artifact;
    use changegate_core::model::PatchSet;
    use changegate_core::model::PolicyViolation;
    use changegate_core::model::Repo;
    use changegate_core::model::StageStatus;
    use changegate_core::model::Workflow;
    use changegate_core::model::WorkflowEvent;
    use changegate_core::model::WorkflowRun;
    use changegate_core::model::WorkflowState;
    use changegate_core::time::Timestamp;

    use super::*;

    #[derive(Default)]
    struct FakeStore {
        events: Mutex<Vec<WorkflowEvent>>,
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn load_workflow(&self, id: &WorkflowId) -> Result<Workflow, StoreError> {
            Err(StoreError::NotFound(id.as_str().to_owned()))
        }
        async fn insert_workflow(&self, _workflow: &Workflow) -> Result<(), StoreError> {
            Ok(())
        }
        async fn update_workflow(&self, _workflow: &Workflow) -> Result<(), StoreError> {
            Ok(())
        }
        async fn insert_artifact(&self, _artifact: &Artifact) -> Result<(), StoreError> {
            Ok(())
        }
        async fn latest_artifact(&self, _workflow_id: &WorkflowId, _kind: ArtifactKind) -> Result<Option<Artifact>, StoreError> {
            Ok(None)
        }
        async fn load_artifact(&self, id: &ArtifactId) -> Result<Artifact, StoreError> {
            Err(StoreError::NotFound(id.as_str().to_owned()))
        }
        async fn insert_patch_set(&self, _patch_set: &PatchSet) -> Result<(), StoreError> {
            Ok(())
        }
        async fn update_patch_set(&self, _patch_set: &PatchSet) -> Result<(), StoreError> {
            Ok(())
        }
        async fn latest_patch_set(&self, _workflow_id: &WorkflowId) -> Result<Option<PatchSet>, StoreError> {
            Ok(None)
        }
        async fn load_patch_set(&self, id: &PatchSetId) -> Result<PatchSet, StoreError> {
            Err(StoreError::NotFound(id.as_str().to_owned()))
        }
        async fn insert_approval(&self, _approval: &Approval) -> Result<(), StoreError> {
            Ok(())
        }
        async fn list_approvals(&self, _workflow_id: &WorkflowId) -> Result<Vec<Approval>, StoreError> {
            Ok(Vec::new())
        }
        async fn replace_violations(&self, _patch_set_id: &PatchSetId, _violations: &[PolicyViolation]) -> Result<(), StoreError> {
            Ok(())
        }
        async fn list_violations(&self, _patch_set_id: &PatchSetId) -> Result<Vec<PolicyViolation>, StoreError> {
            Ok(Vec::new())
        }
        async fn append_event(&self, event: &WorkflowEvent) -> Result<(), StoreError> {
            self.events.lock().expect("lock").push(event.clone());
            Ok(())
        }
        async fn list_events(&self, workflow_id: &WorkflowId) -> Result<Vec<WorkflowEvent>, StoreError> {
            Ok(self.events.lock().expect("lock").iter().filter(|event| &event.workflow_id == workflow_id).cloned().collect())
        }
        async fn start_run(&self, _run: &WorkflowRun) -> Result<(), StoreError> {
            Ok(())
        }
        async fn update_run(&self, _run: &WorkflowRun) -> Result<(), StoreError> {
            Ok(())
        }
        async fn find_runs_by_input_hash(&self, _input_hash: &str) -> Result<Vec<WorkflowRun>, StoreError> {
            Ok(Vec::new())
        }
        async fn with_workflow_lock<'a>(&'a self, _workflow_id: &'a WorkflowId, f: Box<dyn FnOnce() -> Result<(), StoreError> + Send + 'a>) -> Result<(), StoreError> {
            f()
        }
    }

    fn workflow(now: Timestamp) -> Workflow {
        Workflow {
            id: WorkflowId::new("wf-1"),
            state: WorkflowState::PrOpen,
            stage: StageName::Pr,
            stage_status: StageStatus::Processing,
            feature_goal: "add widgets".to_owned(),
            business_justification: "customer ask".to_owned(),
            repos: vec![Repo { owner: "acme".to_owned(), name: "widgets".to_owned(), base_branch: "main".to_owned(), role: "primary".to_owned() }],
            feedback: None,
            created_at: now,
            updated_at: now,
            base_sha: Some("abc123".to_owned()),
        }
    }

    #[tokio::test]
    async fn records_the_already_opened_pr() {
        let now = Timestamp::from_unix_millis(1_000);
        let store = Arc::new(FakeStore::default());
        store
            .append_event(&WorkflowEvent {
                id: EventId::new("evt-1"),
                workflow_id: WorkflowId::new("wf-1"),
                event_type: "worker.apply_patches.completed".to_owned(),
                payload: json!({ "prNumber": 42, "prUrl": "https://example.invalid/pr/42" }),
                recorded_at: now,
            })
            .await
            .expect("inserts");
        let worker = PrWorker::new(store);
        let inputs = StageInputs { workflow: workflow(now), prior_artifacts: Vec::new(), payload: json!({}) };
        let artifact = worker.process_artifact(&inputs).await.expect("succeeds");
        assert_eq!(artifact["prNumber"], 42);
    }

    #[tokio::test]
    async fn missing_apply_patches_event_is_an_error() {
        let now = Timestamp::from_unix_millis(1_000);
        let worker = PrWorker::new(Arc::new(FakeStore::default()));
        let inputs = StageInputs { workflow: workflow(now), prior_artifacts: Vec::new(), payload: json!({}) };
        assert!(worker.process_artifact(&inputs).await.is_err());
    }
}

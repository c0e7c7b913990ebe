// crates/changegate-worker/src/stages/policy_eval.rs
// ============================================================================
// Module: Policy Stage
// Description: Evaluates the latest PatchSet's diff against Gate2 and
//              persists the resulting violations.
// Purpose: Give the orchestrator's hasBlockingPolicyViolations /
//          hasPolicyBeenEvaluated queries something to read back.
// Dependencies: changegate-core, changegate-policy, async-trait
// ============================================================================

//! ## Overview
//! [`PolicyWorker`] is the one gated stage whose `process_artifact` has a
//! side effect beyond the generic artifact-persistence framework: besides
//! returning the [`changegate_core::model::ArtifactKind::PolicyV1`] summary
//! for `run_stage_job` to persist, it calls
//! [`Store::replace_violations`] so the orchestrator's policy queries (§4.5)
//! see up-to-date rows. This is why it holds its own `Arc<dyn Store>`,
//! mirroring how [`crate::run_recorder::RunRecorder`] holds one.

use std::sync::Arc;

use async_trait::async_trait;
use changegate_core::identifiers::StageName;
use changegate_core::identifiers::ViolationId;
use changegate_core::interfaces::Store;
use changegate_core::model::ArtifactKind;
use changegate_core::time::Timestamp;
use changegate_policy::Gate2Result;
use changegate_policy::config::Gate2Config;
use changegate_policy::evaluate_gate2;
use serde_json::Value;
use serde_json::json;

use crate::stage_worker::StageInputs;
use crate::stage_worker::StageWorker;

/// Evaluates the latest PatchSet against Gate2 and records its violations.
pub struct PolicyWorker {
    /// The store, for loading the PatchSet and persisting violations.
    store: Arc<dyn Store>,
    /// The Gate2 configuration this workflow's repositories are evaluated
    /// against.
    config: Gate2Config,
}

impl PolicyWorker {
    /// Creates a policy worker bound to `store` and `config`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: Gate2Config) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl StageWorker for PolicyWorker {
    fn stage(&self) -> StageName {
        StageName::Policy
    }

    fn artifact_kind(&self) -> ArtifactKind {
        ArtifactKind::PolicyV1
    }

    async fn process_artifact(&self, inputs: &StageInputs) -> Result<Value, String> {
        let patch_set = self
            .store
            .latest_patch_set(&inputs.workflow.id)
            .await
            .map_err(|err| err.to_string())?
            .ok_or_else(|| "no patch set proposed for this workflow".to_owned())?;

        let diff: String = patch_set.patches.iter().map(|patch| patch.diff.as_str()).collect::<Vec<_>>().join("\n");
        let risk_levels: Vec<_> = patch_set.patches.iter().map(|patch| patch.risk_level).collect();
        let now = Timestamp::from_unix_millis(inputs.workflow.updated_at.as_unix_millis());
        let result: Gate2Result = evaluate_gate2(&diff, &self.config, &risk_levels, now);

        let violations = result
            .violations
            .iter()
            .enumerate()
            .map(|(index, violation)| changegate_core::model::PolicyViolation {
                id: ViolationId::new(format!("{}:{index}", patch_set.id.as_str())),
                patch_set_id: patch_set.id.clone(),
                rule: violation.rule.clone(),
                severity: violation.severity,
                file: violation.file.clone(),
                line: violation.line,
                message: violation.message.clone(),
                evidence: violation.evidence.clone(),
            })
            .collect::<Vec<_>>();

        self.store.replace_violations(&patch_set.id, &violations).await.map_err(|err| err.to_string())?;

        Ok(json!({
            "patchSetId": patch_set.id.as_str(),
            "verdict": result.verdict,
            "blockingCount": result.blocking_count,
            "warningCount": result.warning_count,
            "summary": result.summary,
        }))
    }
}

#[cfg(test)]
mod tests {
    use changegate_core::identifiers::ArtifactId;
    use changegate_core::identifiers::PatchId;
    use changegate_core::identifiers::WorkflowId;
    use changegate_core::interfaces::StoreError;
    use changegate_core::model::Approval;
    use changegate_core::model::Artifact;
    use changegate_core::model::FileAction;
    use changegate_core::model::Patch;
    use changegate_core::model::PatchFileChange;
    use changegate_core::model::PatchSet;
    use changegate_core::model::PatchSetStatus;
    use changegate_core::model::PolicyViolation;
    use changegate_core::model::Repo;
    use changegate_core::model::RiskLevel;
    use changegate_core::model::StageStatus;
    use changegate_core::model::Workflow;
    use changegate_core::model::WorkflowEvent;
    use changegate_core::model::WorkflowRun;
    use changegate_core::model::WorkflowState;

    use super::*;

    #[derive(Default)]
    struct FakeStore {
        patch_set: std::sync::Mutex<Option<PatchSet>>,
        violations: std::sync::Mutex<Vec<PolicyViolation>>,
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
            Ok(self.patch_set.lock().expect("lock").clone())
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
        async fn replace_violations(&self, _patch_set_id: &PatchSetId, violations: &[PolicyViolation]) -> Result<(), StoreError> {
            *self.violations.lock().expect("lock") = violations.to_vec();
            Ok(())
        }
        async fn list_violations(&self, _patch_set_id: &PatchSetId) -> Result<Vec<PolicyViolation>, StoreError> {
            Ok(self.violations.lock().expect("lock").clone())
        }
        async fn append_event(&self, _event: &WorkflowEvent) -> Result<(), StoreError> {
            Ok(())
        }
        async fn list_events(&self, _workflow_id: &WorkflowId) -> Result<Vec<WorkflowEvent>, StoreError> {
            Ok(Vec::new())
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
            state: WorkflowState::PatchesProposed,
            stage: StageName::Policy,
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

    fn patch_set() -> PatchSet {
        PatchSet {
            id: PatchSetId::new("ps-1"),
            workflow_id: WorkflowId::new("wf-1"),
            artifact_id: ArtifactId::new("art-1"),
            title: "add widgets".to_owned(),
            base_sha: "abc123".to_owned(),
            status: PatchSetStatus::Proposed,
            patches: vec![Patch {
                id: PatchId::new("p1"),
                task_id: None,
                proposed_by: None,
                title: "t".to_owned(),
                summary: "s".to_owned(),
                diff: "diff --git a/src/lib.rs b/src/lib.rs\n--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,1 +1,1 @@\n-old\n+new\n".to_owned(),
                files: vec![PatchFileChange { path: "src/lib.rs".to_owned(), action: FileAction::Modify, additions: 1, deletions: 1 }],
                adds_tests: false,
                risk_level: RiskLevel::Low,
                proposed_commands: Vec::new(),
            }],
        }
    }

    #[tokio::test]
    async fn evaluates_and_persists_violations_for_a_clean_diff() {
        let store = Arc::new(FakeStore::default());
        *store.patch_set.lock().expect("lock") = Some(patch_set());
        let worker = PolicyWorker::new(store.clone(), Gate2Config::default());
        let inputs = StageInputs { workflow: workflow(Timestamp::from_unix_millis(1_000)), prior_artifacts: Vec::new(), payload: json!({}) };
        let artifact = worker.process_artifact(&inputs).await.expect("succeeds");
        assert_eq!(artifact["patchSetId"], "ps-1");
    }

    #[tokio::test]
    async fn no_patch_set_is_an_error() {
        let store = Arc::new(FakeStore::default());
        let worker = PolicyWorker::new(store, Gate2Config::default());
        let inputs = StageInputs { workflow: workflow(Timestamp::from_unix_millis(1_000)), prior_artifacts: Vec::new(), payload: json!({}) };
        assert!(worker.process_artifact(&inputs).await.is_err());
    }
}

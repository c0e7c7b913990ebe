// crates/changegate-worker/src/stages/evaluate_policy.rs
// ============================================================================
// Module: Evaluate Policy Job
// Description: The automatic job the transition function enqueues from
//              `PATCHES_PROPOSED` whenever the latest PatchSet has not yet
//              been evaluated against Gate2.
// Purpose: Feed `TransitionContext::has_blocking_policy_violations` without
//          requiring the orchestrator to run Gate2 inline.
// Dependencies: changegate-core, changegate-policy, async-trait
// ============================================================================

//! ## Overview
//! [`EvaluatePolicyWorker`] is the `JobWorker` counterpart to
//! [`crate::stages::policy_eval::PolicyWorker`]: both evaluate the latest
//! PatchSet's diff against Gate2 and call
//! [`changegate_core::interfaces::Store::replace_violations`]. This one
//! backs the `evaluate_policy` job the transition function enqueues directly
//! (`crate::stage_worker` terminology: a `JobWorker`, not a gated
//! `StageWorker` — there is no human approval gate and no artifact), so the
//! orchestrator can turn its completion into a `PolicyEvaluated` event
//! without re-deriving the verdict itself.

use std::sync::Arc;

use async_trait::async_trait;
use changegate_core::identifiers::ViolationId;
use changegate_core::interfaces::Store;
use changegate_core::model::PolicyViolation;
use changegate_core::time::Timestamp;
use changegate_policy::Gate2Result;
use changegate_policy::config::Gate2Config;
use changegate_policy::evaluate_gate2;
use serde_json::Value;
use serde_json::json;

use crate::stage_worker::JobWorker;
use crate::stage_worker::StageInputs;

/// Evaluates the latest PatchSet against Gate2 on behalf of the workflow-level
/// `PATCHES_PROPOSED` transition.
pub struct EvaluatePolicyWorker {
    /// The store, for loading the PatchSet and persisting violations.
    store: Arc<dyn Store>,
    /// The Gate2 configuration this workflow's repositories are evaluated
    /// against.
    config: Gate2Config,
}

impl EvaluatePolicyWorker {
    /// Creates a worker bound to `store` and `config`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: Gate2Config) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl JobWorker for EvaluatePolicyWorker {
    fn job_name(&self) -> &str {
        "evaluate_policy"
    }

    async fn run(&self, inputs: &StageInputs) -> Result<Value, String> {
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
            .map(|(index, violation)| PolicyViolation {
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
            "hasBlockingViolations": result.blocking_count > 0,
            "blockingCount": result.blocking_count,
            "warningCount": result.warning_count,
        }))
    }
}

#[cfg(test)]
mod tests {
    use changegate_core::identifiers::ArtifactId;
    use changegate_core::identifiers::PatchId;
    use changegate_core::identifiers::PatchSetId;
    use changegate_core::identifiers::StageName;
    use changegate_core::identifiers::WorkflowId;
    use changegate_core::interfaces::StoreError;
    use changegate_core::model::Approval;
    use changegate_core::model::Artifact;
    use changegate_core::model::ArtifactKind;
    use changegate_core::model::FileAction;
    use changegate_core::model::Patch;
    use changegate_core::model::PatchFileChange;
    use changegate_core::model::PatchSet;
    use changegate_core::model::PatchSetStatus;
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
            stage: StageName::Patches,
            stage_status: StageStatus::Ready,
            feature_goal: "add widgets".to_owned(),
            business_justification: "customer ask".to_owned(),
            repos: vec![Repo { owner: "acme".to_owned(), name: "widgets".to_owned(), base_branch: "main".to_owned(), role: "primary".to_owned() }],
            feedback: None,
            created_at: now,
            updated_at: now,
            base_sha: Some("abc123".to_owned()),
        }
    }

    fn patch_set(diff: String, file: &str) -> PatchSet {
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
                diff,
                files: vec![PatchFileChange { path: file.to_owned(), action: FileAction::Modify, additions: 1, deletions: 1 }],
                adds_tests: false,
                risk_level: RiskLevel::Low,
                proposed_commands: Vec::new(),
            }],
        }
    }

    fn clean_diff(file: &str) -> String {
        format!("diff --git a/{file} b/{file}\n--- a/{file}\n+++ b/{file}\n@@ -1,1 +1,1 @@\n-old\n+new\n")
    }

    #[tokio::test]
    async fn clean_diff_reports_no_blocking_violations() {
        let store = Arc::new(FakeStore::default());
        *store.patch_set.lock().expect("lock") = Some(patch_set(clean_diff("src/lib.rs"), "src/lib.rs"));
        let worker = EvaluatePolicyWorker::new(store, Gate2Config::default());
        let inputs = StageInputs { workflow: workflow(Timestamp::from_unix_millis(1_000)), prior_artifacts: Vec::new(), payload: json!({}) };
        let result = worker.run(&inputs).await.expect("succeeds");
        assert_eq!(result["hasBlockingViolations"], false);
    }

    #[tokio::test]
    async fn frozen_file_diff_reports_blocking_violations() {
        let store = Arc::new(FakeStore::default());
        *store.patch_set.lock().expect("lock") = Some(patch_set(clean_diff(".github/workflows/ci.yml"), ".github/workflows/ci.yml"));
        let worker = EvaluatePolicyWorker::new(store, Gate2Config::default());
        let inputs = StageInputs { workflow: workflow(Timestamp::from_unix_millis(1_000)), prior_artifacts: Vec::new(), payload: json!({}) };
        let result = worker.run(&inputs).await.expect("succeeds");
        assert_eq!(result["hasBlockingViolations"], true);
    }

    #[tokio::test]
    async fn no_patch_set_is_an_error() {
        let store = Arc::new(FakeStore::default());
        let worker = EvaluatePolicyWorker::new(store, Gate2Config::default());
        let inputs = StageInputs { workflow: workflow(Timestamp::from_unix_millis(1_000)), prior_artifacts: Vec::new(), payload: json!({}) };
        assert!(worker.run(&inputs).await.is_err());
    }
}

// crates/changegate-orchestrator/src/context.rs
// ============================================================================
// Module: Transition Context Derivation
// Description: Derives `changegate_core::transition::TransitionContext` from
//              `Store` queries, the one piece of I/O the pure transition
//              function itself never performs.
// Purpose: Keep the derivation in one place so every call site (the FSM path
//          and the stage-pipeline reconciliation path) sees the same facts.
// Dependencies: changegate-core
// ============================================================================

//! ## Overview
//! `has_policy_been_evaluated` has no dedicated column; it is re-derived from
//! whether a `worker.evaluate_policy.completed` event naming the current
//! latest PatchSet has ever been recorded, the same "read the event back"
//! idiom [`changegate_worker`]'s `pr` stage worker uses for its own
//! artifact content.

use changegate_core::identifiers::WorkflowId;
use changegate_core::interfaces::Store;
use changegate_core::model::ApprovalKind;
use changegate_core::model::Severity;
use changegate_core::transition::TransitionContext;
use serde_json::Value;

use crate::error::OrchestratorError;

/// The event type [`crate::stage_dispatch`] expects `evaluate_policy`
/// completions to be recorded under (mirrors `run_job`'s
/// `worker.{job_name}.completed` naming in `changegate-worker`).
const EVALUATE_POLICY_COMPLETED: &str = "worker.evaluate_policy.completed";

/// Derives a [`TransitionContext`] for `workflow_id` from the store.
///
/// # Errors
///
/// Returns [`OrchestratorError::Store`] if any underlying query fails.
pub async fn build_context(store: &dyn Store, workflow_id: &WorkflowId) -> Result<TransitionContext, OrchestratorError> {
    let latest_patch_set = store.latest_patch_set(workflow_id).await?;
    let has_patch_sets = latest_patch_set.is_some();
    let latest_patch_set_id = latest_patch_set.map(|patch_set| patch_set.id);

    let approvals = store.list_approvals(workflow_id).await?;
    let has_approval_to_apply = approvals.iter().any(|approval| approval.kind == ApprovalKind::ApplyPatches);

    let has_blocking_policy_violations = match &latest_patch_set_id {
        Some(patch_set_id) => store.list_violations(patch_set_id).await?.iter().any(|violation| violation.severity == Severity::Block),
        None => false,
    };

    let has_policy_been_evaluated = match &latest_patch_set_id {
        Some(patch_set_id) => {
            let events = store.list_events(workflow_id).await?;
            events.iter().any(|event| {
                event.event_type == EVALUATE_POLICY_COMPLETED && event.payload.get("patchSetId").and_then(Value::as_str) == Some(patch_set_id.as_str())
            })
        }
        None => false,
    };

    Ok(TransitionContext {
        workflow_id: workflow_id.clone(),
        has_patch_sets,
        latest_patch_set_id,
        has_approval_to_apply,
        has_blocking_policy_violations,
        has_policy_been_evaluated,
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use changegate_core::identifiers::ArtifactId;
    use changegate_core::identifiers::PatchId;
    use changegate_core::identifiers::PatchSetId;
    use changegate_core::identifiers::ViolationId;
    use changegate_core::interfaces::StoreError;
    use changegate_core::model::Approval;
    use changegate_core::model::Artifact;
    use changegate_core::model::ArtifactKind;
    use changegate_core::model::FileAction;
    use changegate_core::model::Patch;
    use changegate_core::model::PatchFileChange;
    use changegate_core::model::PatchSet;
    use changegate_core::model::PatchSetStatus;
    use changegate_core::model::PolicyViolation;
    use changegate_core::model::RiskLevel;
    use changegate_core::model::Workflow;
    use changegate_core::model::WorkflowEvent;
    use changegate_core::model::WorkflowRun;
    use changegate_core::time::Timestamp;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct FakeStore {
        patch_set: Option<PatchSet>,
        approvals: Vec<Approval>,
        violations: Vec<PolicyViolation>,
        events: Vec<WorkflowEvent>,
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
            Ok(self.patch_set.clone())
        }
        async fn load_patch_set(&self, id: &PatchSetId) -> Result<PatchSet, StoreError> {
            Err(StoreError::NotFound(id.as_str().to_owned()))
        }
        async fn insert_approval(&self, _approval: &Approval) -> Result<(), StoreError> {
            Ok(())
        }
        async fn list_approvals(&self, _workflow_id: &WorkflowId) -> Result<Vec<Approval>, StoreError> {
            Ok(self.approvals.clone())
        }
        async fn replace_violations(&self, _patch_set_id: &PatchSetId, _violations: &[PolicyViolation]) -> Result<(), StoreError> {
            Ok(())
        }
        async fn list_violations(&self, _patch_set_id: &PatchSetId) -> Result<Vec<PolicyViolation>, StoreError> {
            Ok(self.violations.clone())
        }
        async fn append_event(&self, _event: &WorkflowEvent) -> Result<(), StoreError> {
            Ok(())
        }
        async fn list_events(&self, _workflow_id: &WorkflowId) -> Result<Vec<WorkflowEvent>, StoreError> {
            Ok(self.events.clone())
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

    fn patch_set() -> PatchSet {
        PatchSet {
            id: PatchSetId::new("ps-1"),
            workflow_id: WorkflowId::new("wf-1"),
            artifact_id: ArtifactId::new("art-1"),
            title: "t".to_owned(),
            base_sha: "abc123".to_owned(),
            status: PatchSetStatus::Proposed,
            patches: vec![Patch {
                id: PatchId::new("p1"),
                task_id: None,
                proposed_by: None,
                title: "t".to_owned(),
                summary: "s".to_owned(),
                diff: String::new(),
                files: vec![PatchFileChange { path: "a.rs".to_owned(), action: FileAction::Modify, additions: 1, deletions: 1 }],
                adds_tests: false,
                risk_level: RiskLevel::Low,
                proposed_commands: Vec::new(),
            }],
        }
    }

    #[tokio::test]
    async fn absent_patch_set_yields_all_false() {
        let store = FakeStore::default();
        let ctx = build_context(&store, &WorkflowId::new("wf-1")).await.expect("builds");
        assert!(!ctx.has_patch_sets);
        assert!(!ctx.has_policy_been_evaluated);
        assert!(!ctx.has_blocking_policy_violations);
    }

    #[tokio::test]
    async fn blocking_violation_is_detected() {
        let store = FakeStore {
            patch_set: Some(patch_set()),
            violations: vec![PolicyViolation {
                id: ViolationId::new("v1"),
                patch_set_id: PatchSetId::new("ps-1"),
                rule: "frozen_file".to_owned(),
                severity: Severity::Block,
                file: "a.rs".to_owned(),
                line: None,
                message: "blocked".to_owned(),
                evidence: String::new(),
            }],
            ..Default::default()
        };
        let ctx = build_context(&store, &WorkflowId::new("wf-1")).await.expect("builds");
        assert!(ctx.has_patch_sets);
        assert!(ctx.has_blocking_policy_violations);
    }

    #[tokio::test]
    async fn policy_evaluated_event_for_the_current_patch_set_is_detected() {
        let store = FakeStore {
            patch_set: Some(patch_set()),
            events: vec![WorkflowEvent {
                id: changegate_core::identifiers::EventId::new("e1"),
                workflow_id: WorkflowId::new("wf-1"),
                event_type: EVALUATE_POLICY_COMPLETED.to_owned(),
                payload: json!({ "patchSetId": "ps-1", "hasBlockingViolations": false }),
                recorded_at: Timestamp::from_unix_millis(1_000),
            }],
            ..Default::default()
        };
        let ctx = build_context(&store, &WorkflowId::new("wf-1")).await.expect("builds");
        assert!(ctx.has_policy_been_evaluated);
    }

    #[tokio::test]
    async fn approval_to_apply_is_detected() {
        let store = FakeStore {
            approvals: vec![Approval {
                id: changegate_core::identifiers::ApprovalId::new("a1"),
                workflow_id: WorkflowId::new("wf-1"),
                stage: changegate_core::identifiers::StageName::Patches,
                kind: ApprovalKind::ApplyPatches,
                reason: None,
                recorded_at: Timestamp::from_unix_millis(1_000),
            }],
            ..Default::default()
        };
        let ctx = build_context(&store, &WorkflowId::new("wf-1")).await.expect("builds");
        assert!(ctx.has_approval_to_apply);
    }
}

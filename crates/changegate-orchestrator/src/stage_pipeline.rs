// crates/changegate-orchestrator/src/stage_pipeline.rs
// ============================================================================
// Module: Gated Stage Pipeline
// Description: Human approve/reject/request-changes handling for the
//              `stage`/`stageStatus`-gated pipeline, orthogonal to
//              `WorkflowState`.
// Purpose: Advance `Workflow::stage` on approval, record the gating
//          `Approval`, and reconcile the one point where the two tracks
//          meet: approving the Patches stage makes a PatchSet available to
//          the `WorkflowState` machine for the first time.
// Dependencies: changegate-core
// ============================================================================

//! ## Overview
//! `StageName::next()`/`stage`/`stage_status` move independently of
//! `WorkflowState`: [`Orchestrator::approve_stage`] never calls
//! [`transition`] for an ordinary stage, because `TransitionEvent::StageApproved`
//! and its siblings are deliberately unhandled inside `transition` itself
//! (`_ => identity(...)`). The one exception is the Patches stage: approving
//! it is what first makes a PatchSet exist for `WorkflowState` purposes, so
//! the handler below reconciles by setting `WorkflowState::PatchesProposed`
//! directly (bypassing the terminal stickiness a workflow sitting in
//! `NeedsHuman` after an empty ingest would otherwise have) and immediately
//! re-running `transition` with a freshly built context, exactly as
//! `patches_proposed` would have been entered had a PatchSet existed before
//! the state machine last looked.

use changegate_core::identifiers::ApprovalId;
use changegate_core::identifiers::StageName;
use changegate_core::identifiers::WorkflowId;
use changegate_core::interfaces::EnqueueOptions;
use changegate_core::model::Approval;
use changegate_core::model::ApprovalKind;
use changegate_core::model::StageStatus;
use changegate_core::model::WorkflowState;
use changegate_core::time::Timestamp;
use changegate_core::transition::TransitionContext;
use changegate_core::transition::TransitionDecision;
use changegate_core::transition::TransitionEvent;
use changegate_core::transition::transition;
use serde_json::json;

use crate::context::build_context;
use crate::error::OrchestratorError;
use crate::orchestrator::Orchestrator;

impl Orchestrator {
    /// Approves `stage` for `workflow_id`: records an [`Approval`], advances
    /// `stage`/`stage_status`, and — for the Patches stage only — bridges
    /// into the `WorkflowState` machine.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidStageTransition`] if the workflow
    /// is not currently on `stage`, and [`OrchestratorError::Store`] /
    /// [`OrchestratorError::Queue`] on any collaborator failure.
    pub async fn approve_stage(&self, workflow_id: &WorkflowId, stage: StageName, reason: Option<String>, now: Timestamp) -> Result<Option<TransitionDecision>, OrchestratorError> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;
        let mut workflow = self.store().load_workflow(workflow_id).await?;
        require_current_stage(&workflow, stage)?;

        let approval_kind = if stage == StageName::Patches { ApprovalKind::ApplyPatches } else { ApprovalKind::StageApproval };
        let approval = Approval {
            id: ApprovalId::new(format!("{workflow_id}:{}:approve:{}", stage.as_str(), now.as_unix_millis())),
            workflow_id: workflow_id.clone(),
            stage,
            kind: approval_kind,
            reason,
            recorded_at: now,
        };
        self.store().insert_approval(&approval).await?;

        match stage.next() {
            Some(next_stage) => {
                workflow.stage = next_stage;
                workflow.stage_status = StageStatus::Pending;
            }
            None => workflow.stage_status = StageStatus::Approved,
        }
        workflow.updated_at = now;
        self.store().update_workflow(&workflow).await?;
        append_stage_event(self, workflow_id, "stage.approved", stage, now).await?;

        if stage != StageName::Patches {
            return Ok(None);
        }

        // The Patches stage produces the workflow's first PatchSet; bridge
        // it into the coarse state machine now that one exists.
        let mut workflow = self.store().load_workflow(workflow_id).await?;
        workflow.state = WorkflowState::PatchesProposed;
        workflow.updated_at = now;
        self.store().update_workflow(&workflow).await?;

        let ctx = build_context(self.store().as_ref(), workflow_id).await?;
        let decision = reconcile_patches_approved(&ctx);

        let mut workflow = self.store().load_workflow(workflow_id).await?;
        workflow.state = decision.next_state;
        workflow.updated_at = now;
        self.store().update_workflow(&workflow).await?;

        for job in &decision.enqueue {
            let idempotency_key = format!("{workflow_id}:{}:{}", job.name, decision.reason);
            self.queues().enqueue(job.queue.as_str(), job.payload.clone(), EnqueueOptions { idempotency_key: Some(idempotency_key) }).await?;
        }

        Ok(Some(decision))
    }

    /// Rejects `stage` for `workflow_id`: records a rejection event and
    /// moves the workflow to the terminal `Rejected` `WorkflowState`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidStageTransition`] if the workflow
    /// is not currently on `stage`, and [`OrchestratorError::Store`] on any
    /// store failure.
    pub async fn reject_stage(&self, workflow_id: &WorkflowId, stage: StageName, reason: String, now: Timestamp) -> Result<(), OrchestratorError> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;
        let mut workflow = self.store().load_workflow(workflow_id).await?;
        require_current_stage(&workflow, stage)?;

        workflow.stage_status = StageStatus::Rejected;
        workflow.state = WorkflowState::Rejected;
        workflow.feedback = Some(reason.clone());
        workflow.updated_at = now;
        self.store().update_workflow(&workflow).await?;
        append_stage_event(self, workflow_id, "stage.rejected", stage, now).await?;
        Ok(())
    }

    /// Records requested changes on `stage`: the stage is re-enqueued by
    /// resetting `stage_status` to `NeedsChanges` with the human's feedback
    /// attached; it is left to the worker re-run path to clear it back to
    /// `Processing`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidStageTransition`] if the workflow
    /// is not currently on `stage`, and [`OrchestratorError::Store`] on any
    /// store failure.
    pub async fn request_stage_changes(&self, workflow_id: &WorkflowId, stage: StageName, reason: String, now: Timestamp) -> Result<(), OrchestratorError> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;
        let mut workflow = self.store().load_workflow(workflow_id).await?;
        require_current_stage(&workflow, stage)?;

        workflow.stage_status = StageStatus::NeedsChanges;
        workflow.feedback = Some(reason.clone());
        workflow.updated_at = now;
        self.store().update_workflow(&workflow).await?;
        append_stage_event(self, workflow_id, "stage.changes_requested", stage, now).await?;
        Ok(())
    }
}

/// Errors if `workflow` is not currently on `stage`.
fn require_current_stage(workflow: &changegate_core::model::Workflow, stage: StageName) -> Result<(), OrchestratorError> {
    if workflow.stage != stage {
        return Err(OrchestratorError::InvalidStageTransition(format!("workflow {} is on stage {} not {stage}", workflow.id, workflow.stage)));
    }
    Ok(())
}

/// Re-enters `transition` for the Patches-stage reconciliation: from
/// `PatchesProposed`, `PolicyEvaluated` is the event that carries the
/// bit `patches_proposed` actually branches on.
fn reconcile_patches_approved(ctx: &TransitionContext) -> TransitionDecision {
    transition(WorkflowState::PatchesProposed, &TransitionEvent::PolicyEvaluated { has_blocking_violations: ctx.has_blocking_policy_violations }, ctx)
}

/// Appends a `stage.*` audit event, independent of the `workflow.transitioned`
/// events [`Orchestrator::commit_transition_locked`] appends.
async fn append_stage_event(orchestrator: &Orchestrator, workflow_id: &WorkflowId, event_type: &str, stage: StageName, now: Timestamp) -> Result<(), OrchestratorError> {
    let event = changegate_core::model::WorkflowEvent {
        id: changegate_core::identifiers::EventId::new(format!("{workflow_id}:{event_type}:{}", now.as_unix_millis())),
        workflow_id: workflow_id.clone(),
        event_type: event_type.to_owned(),
        payload: json!({ "stage": stage.as_str() }),
        recorded_at: now,
    };
    orchestrator.store().append_event(&event).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use changegate_core::identifiers::ArtifactId;
    use changegate_core::identifiers::PatchSetId;
    use changegate_core::interfaces::QueueError;
    use changegate_core::interfaces::Queues;
    use changegate_core::interfaces::Store;
    use changegate_core::interfaces::StoreError;
    use changegate_core::model::Artifact;
    use changegate_core::model::ArtifactKind;
    use changegate_core::model::FileAction;
    use changegate_core::model::Patch;
    use changegate_core::model::PatchFileChange;
    use changegate_core::model::PatchSet;
    use changegate_core::model::PatchSetStatus;
    use changegate_core::model::PolicyViolation;
    use changegate_core::model::Repo;
    use changegate_core::model::RiskLevel;
    use changegate_core::model::Workflow;
    use changegate_core::model::WorkflowEvent;
    use changegate_core::model::WorkflowRun;
    use serde_json::Value;

    use super::*;

    #[derive(Default)]
    struct FakeStore {
        workflows: StdMutex<HashMap<String, Workflow>>,
        patch_set: StdMutex<Option<PatchSet>>,
        approvals: StdMutex<Vec<Approval>>,
        events: StdMutex<Vec<WorkflowEvent>>,
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn load_workflow(&self, id: &WorkflowId) -> Result<Workflow, StoreError> {
            self.workflows.lock().expect("lock").get(id.as_str()).cloned().ok_or_else(|| StoreError::NotFound(id.as_str().to_owned()))
        }
        async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
            self.workflows.lock().expect("lock").insert(workflow.id.as_str().to_owned(), workflow.clone());
            Ok(())
        }
        async fn update_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
            self.workflows.lock().expect("lock").insert(workflow.id.as_str().to_owned(), workflow.clone());
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
        async fn insert_approval(&self, approval: &Approval) -> Result<(), StoreError> {
            self.approvals.lock().expect("lock").push(approval.clone());
            Ok(())
        }
        async fn list_approvals(&self, workflow_id: &WorkflowId) -> Result<Vec<Approval>, StoreError> {
            Ok(self.approvals.lock().expect("lock").iter().filter(|approval| &approval.workflow_id == workflow_id).cloned().collect())
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

    #[derive(Default)]
    struct FakeQueues {
        enqueued: StdMutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Queues for FakeQueues {
        async fn enqueue(&self, queue: &str, payload: Value, _options: EnqueueOptions) -> Result<(), QueueError> {
            self.enqueued.lock().expect("lock").push((queue.to_owned(), payload));
            Ok(())
        }
    }

    fn workflow(stage: StageName, state: WorkflowState, now: Timestamp) -> Workflow {
        Workflow {
            id: WorkflowId::new("wf-1"),
            state,
            stage,
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

    fn patch_set() -> PatchSet {
        PatchSet {
            id: PatchSetId::new("ps-1"),
            workflow_id: WorkflowId::new("wf-1"),
            artifact_id: ArtifactId::new("art-1"),
            title: "add widgets".to_owned(),
            base_sha: "abc123".to_owned(),
            status: PatchSetStatus::Proposed,
            patches: vec![Patch {
                id: changegate_core::identifiers::PatchId::new("p1"),
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
    async fn approving_an_ordinary_stage_advances_stage_without_touching_state() {
        let store = Arc::new(FakeStore::default());
        let now = Timestamp::from_unix_millis(1_000);
        store.insert_workflow(&workflow(StageName::Feasibility, WorkflowState::Ingested, now)).await.expect("insert");
        let queues = Arc::new(FakeQueues::default());
        let orchestrator = Orchestrator::new(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&queues) as Arc<dyn Queues>);

        let decision = orchestrator.approve_stage(&WorkflowId::new("wf-1"), StageName::Feasibility, None, now).await.expect("approves");
        assert!(decision.is_none());

        let updated = store.load_workflow(&WorkflowId::new("wf-1")).await.expect("loads");
        assert_eq!(updated.stage, StageName::Architecture);
        assert_eq!(updated.stage_status, StageStatus::Pending);
        assert_eq!(updated.state, WorkflowState::Ingested);
    }

    #[tokio::test]
    async fn approving_patches_stage_bridges_into_waiting_user_approval_when_clean() {
        let store = Arc::new(FakeStore::default());
        let now = Timestamp::from_unix_millis(1_000);
        store.insert_workflow(&workflow(StageName::Patches, WorkflowState::NeedsHuman, now)).await.expect("insert");
        *store.patch_set.lock().expect("lock") = Some(patch_set());
        let queues = Arc::new(FakeQueues::default());
        let orchestrator = Orchestrator::new(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&queues) as Arc<dyn Queues>);

        let decision = orchestrator.approve_stage(&WorkflowId::new("wf-1"), StageName::Patches, None, now).await.expect("approves").expect("reconciled");
        assert_eq!(decision.next_state, WorkflowState::WaitingUserApproval);

        let updated = store.load_workflow(&WorkflowId::new("wf-1")).await.expect("loads");
        assert_eq!(updated.state, WorkflowState::WaitingUserApproval);
        assert_eq!(updated.stage, StageName::Policy);

        let approvals = store.list_approvals(&WorkflowId::new("wf-1")).await.expect("loads");
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].kind, ApprovalKind::ApplyPatches);
    }

    #[tokio::test]
    async fn approving_the_wrong_stage_is_rejected() {
        let store = Arc::new(FakeStore::default());
        let now = Timestamp::from_unix_millis(1_000);
        store.insert_workflow(&workflow(StageName::Feasibility, WorkflowState::Ingested, now)).await.expect("insert");
        let queues = Arc::new(FakeQueues::default());
        let orchestrator = Orchestrator::new(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&queues) as Arc<dyn Queues>);

        let result = orchestrator.approve_stage(&WorkflowId::new("wf-1"), StageName::Architecture, None, now).await;
        assert!(matches!(result, Err(OrchestratorError::InvalidStageTransition(_))));
    }

    #[tokio::test]
    async fn rejecting_a_stage_moves_the_workflow_to_rejected() {
        let store = Arc::new(FakeStore::default());
        let now = Timestamp::from_unix_millis(1_000);
        store.insert_workflow(&workflow(StageName::Architecture, WorkflowState::Ingested, now)).await.expect("insert");
        let queues = Arc::new(FakeQueues::default());
        let orchestrator = Orchestrator::new(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&queues) as Arc<dyn Queues>);

        orchestrator.reject_stage(&WorkflowId::new("wf-1"), StageName::Architecture, "not feasible".to_owned(), now).await.expect("rejects");
        let updated = store.load_workflow(&WorkflowId::new("wf-1")).await.expect("loads");
        assert_eq!(updated.state, WorkflowState::Rejected);
        assert_eq!(updated.feedback.as_deref(), Some("not feasible"));
    }
}

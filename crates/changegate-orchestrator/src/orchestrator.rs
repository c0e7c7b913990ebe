// crates/changegate-orchestrator/src/orchestrator.rs
// ============================================================================
// Module: Orchestrator
// Description: Owns the per-workflow lock map, calls `transition` for every
//              `WorkflowState`-level event, commits the decision, and
//              publishes the jobs it enqueues.
// Purpose: The one writer of `Workflow::state`; every other collaborator
//          (stage workers, the CLI, the dispatcher) goes through here.
// Dependencies: changegate-core, tokio
// ============================================================================

//! ## Overview
//! `Orchestrator::commit_transition` is the single choke point for coarse
//! `WorkflowState` changes: build context, call the pure
//! [`changegate_core::transition::transition`], persist the workflow, append
//! an audit event, publish enqueued jobs. [`crate::stage_pipeline`] calls the
//! same choke point for the one reconciliation the two orthogonal tracks
//! require; everything else it does (advancing `stage`/`stage_status`,
//! recording approvals) stays off this path entirely, the way
//! `decision-gate-store-sqlite`'s writer gateway keeps its queue drain and
//! its direct write path sharing one commit routine rather than two.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use changegate_core::identifiers::EventId;
use changegate_core::identifiers::JobName;
use changegate_core::identifiers::WorkflowId;
use changegate_core::interfaces::EnqueueOptions;
use changegate_core::interfaces::Queues;
use changegate_core::interfaces::Store;
use changegate_core::model::Approval;
use changegate_core::model::ApprovalKind;
use changegate_core::model::Workflow;
use changegate_core::model::WorkflowEvent;
use changegate_core::time::Timestamp;
use changegate_core::transition::CiConclusion;
use changegate_core::transition::JobOutcome;
use changegate_core::transition::PullRequestRef;
use changegate_core::transition::TransitionDecision;
use changegate_core::transition::TransitionEvent;
use changegate_core::transition::transition;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;

use crate::context::build_context;
use crate::error::OrchestratorError;

/// Coordinates every write to a `Workflow`'s coarse state, holding an
/// exclusive per-workflow lock for the duration of one transition.
pub struct Orchestrator {
    /// The workflow/artifact/event store.
    store: Arc<dyn Store>,
    /// The job queue publish side.
    queues: Arc<dyn Queues>,
    /// One `tokio::sync::Mutex` per workflow, acquired before a transition
    /// begins and released after it commits. Distinct from
    /// [`Store::with_workflow_lock`], which guards the store's own internal
    /// write path.
    locks: StdMutex<HashMap<WorkflowId, Arc<AsyncMutex<()>>>>,
}

impl Orchestrator {
    /// Creates an orchestrator backed by `store` and `queues`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, queues: Arc<dyn Queues>) -> Self {
        Self { store, queues, locks: StdMutex::new(HashMap::new()) }
    }

    /// Returns the store this orchestrator was built with, for collaborators
    /// (e.g. [`crate::stage_pipeline`]) that need direct read access.
    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Returns the queue publisher this orchestrator was built with.
    pub(crate) fn queues(&self) -> &Arc<dyn Queues> {
        &self.queues
    }

    /// Returns (creating if necessary) the per-workflow lock for `workflow_id`.
    pub(crate) fn lock_for(&self, workflow_id: &WorkflowId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        Arc::clone(locks.entry(workflow_id.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
    }

    /// Inserts a brand-new workflow and drives its first transition
    /// (`WorkflowCreated`), which enqueues the `ingest_context` job.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] on any store or queue failure.
    pub async fn create_workflow(&self, workflow: Workflow, now: Timestamp) -> Result<TransitionDecision, OrchestratorError> {
        let workflow_id = workflow.id.clone();
        self.store.insert_workflow(&workflow).await?;
        self.commit_transition(&workflow_id, TransitionEvent::WorkflowCreated, now).await
    }

    /// Records a job's successful completion and drives the resulting
    /// transition.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] on any store or queue failure.
    pub async fn record_job_completed(&self, workflow_id: &WorkflowId, job: JobName, result: JobOutcome, now: Timestamp) -> Result<TransitionDecision, OrchestratorError> {
        self.commit_transition(workflow_id, TransitionEvent::JobCompleted { job, result }, now).await
    }

    /// Records a job's failure and drives the resulting transition.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] on any store or queue failure.
    pub async fn record_job_failed(&self, workflow_id: &WorkflowId, job: JobName, error: String, now: Timestamp) -> Result<TransitionDecision, OrchestratorError> {
        self.commit_transition(workflow_id, TransitionEvent::JobFailed { job, error }, now).await
    }

    /// Records an `apply_patches` approval and drives the resulting
    /// transition.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] on any store or queue failure.
    pub async fn record_approval(&self, workflow_id: &WorkflowId, reason: Option<String>, now: Timestamp) -> Result<TransitionDecision, OrchestratorError> {
        let approval = Approval {
            id: changegate_core::identifiers::ApprovalId::new(format!("{workflow_id}:apply_patches:{}", now.as_unix_millis())),
            workflow_id: workflow_id.clone(),
            stage: changegate_core::identifiers::StageName::Patches,
            kind: ApprovalKind::ApplyPatches,
            reason,
            recorded_at: now,
        };
        self.store.insert_approval(&approval).await?;
        self.commit_transition(workflow_id, TransitionEvent::ApprovalRecorded, now).await
    }

    /// Records the result of a Gate2 evaluation and drives the resulting
    /// transition.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] on any store or queue failure.
    pub async fn record_policy_evaluated(&self, workflow_id: &WorkflowId, has_blocking_violations: bool, now: Timestamp) -> Result<TransitionDecision, OrchestratorError> {
        self.commit_transition(workflow_id, TransitionEvent::PolicyEvaluated { has_blocking_violations }, now).await
    }

    /// Records a CI conclusion and drives the resulting transition.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] on any store or queue failure.
    pub async fn record_ci_completed(&self, workflow_id: &WorkflowId, conclusion: CiConclusion, now: Timestamp) -> Result<TransitionDecision, OrchestratorError> {
        self.commit_transition(workflow_id, TransitionEvent::CiCompleted { conclusion }, now).await
    }

    /// Records that the open pull request was merged.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] on any store or queue failure.
    pub async fn record_pr_merged(&self, workflow_id: &WorkflowId, now: Timestamp) -> Result<TransitionDecision, OrchestratorError> {
        self.commit_transition(workflow_id, TransitionEvent::PrMerged, now).await
    }

    /// Records that the open pull request was closed without merging.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] on any store or queue failure.
    pub async fn record_pr_closed(&self, workflow_id: &WorkflowId, now: Timestamp) -> Result<TransitionDecision, OrchestratorError> {
        self.commit_transition(workflow_id, TransitionEvent::PrClosed, now).await
    }

    /// Records a workflow-level change request and stores the human's
    /// comment on [`Workflow::feedback`].
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] on any store or queue failure.
    pub async fn request_changes(&self, workflow_id: &WorkflowId, comment: String, now: Timestamp) -> Result<TransitionDecision, OrchestratorError> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;
        let mut workflow = self.store.load_workflow(workflow_id).await?;
        workflow.feedback = Some(comment.clone());
        workflow.updated_at = now;
        self.store.update_workflow(&workflow).await?;
        self.commit_transition_locked(&workflow, TransitionEvent::ChangesRequested { comment }, now).await
    }

    /// Records a human rejection of the latest PatchSet.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] on any store or queue failure.
    pub async fn reject_patch_set(&self, workflow_id: &WorkflowId, reason: String, now: Timestamp) -> Result<TransitionDecision, OrchestratorError> {
        self.commit_transition(workflow_id, TransitionEvent::PatchSetRejected { reason }, now).await
    }

    /// Acquires the per-workflow lock, loads the workflow, and calls
    /// [`Self::commit_transition_locked`].
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] on any store or queue failure.
    pub(crate) async fn commit_transition(&self, workflow_id: &WorkflowId, event: TransitionEvent, now: Timestamp) -> Result<TransitionDecision, OrchestratorError> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;
        let workflow = self.store.load_workflow(workflow_id).await?;
        self.commit_transition_locked(&workflow, event, now).await
    }

    /// Builds context, calls `transition`, persists the next state, appends
    /// an audit event, and publishes every enqueued job. Callers must
    /// already hold `workflow.id`'s lock.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] on any store or queue failure.
    pub(crate) async fn commit_transition_locked(&self, workflow: &Workflow, event: TransitionEvent, now: Timestamp) -> Result<TransitionDecision, OrchestratorError> {
        let ctx = build_context(self.store.as_ref(), &workflow.id).await?;
        let decision = transition(workflow.state, &event, &ctx);

        let mut updated = workflow.clone();
        updated.state = decision.next_state;
        updated.updated_at = now;
        self.store.update_workflow(&updated).await?;

        let audit = WorkflowEvent {
            id: EventId::new(format!("{}:transition:{}", workflow.id, now.as_unix_millis())),
            workflow_id: workflow.id.clone(),
            event_type: "workflow.transitioned".to_owned(),
            payload: json!({
                "event": event_label(&event),
                "nextState": decision.next_state,
                "reason": decision.reason,
            }),
            recorded_at: now,
        };
        self.store.append_event(&audit).await?;

        for job in &decision.enqueue {
            let idempotency_key = format!("{}:{}:{}", workflow.id, job.name, decision.reason);
            self.queues.enqueue(job.queue.as_str(), job.payload.clone(), EnqueueOptions { idempotency_key: Some(idempotency_key) }).await?;
        }

        Ok(decision)
    }
}

/// Renders a [`TransitionEvent`] as a short label for the audit event
/// payload, without carrying its full (potentially large) contents.
fn event_label(event: &TransitionEvent) -> &'static str {
    match event {
        TransitionEvent::WorkflowCreated => "workflow_created",
        TransitionEvent::JobCompleted { .. } => "job_completed",
        TransitionEvent::JobFailed { .. } => "job_failed",
        TransitionEvent::ApprovalRecorded => "approval_recorded",
        TransitionEvent::PolicyEvaluated { .. } => "policy_evaluated",
        TransitionEvent::CiCompleted { .. } => "ci_completed",
        TransitionEvent::PrMerged => "pr_merged",
        TransitionEvent::PrClosed => "pr_closed",
        TransitionEvent::ChangesRequested { .. } => "changes_requested",
        TransitionEvent::PatchSetRejected { .. } => "patch_set_rejected",
        TransitionEvent::StageApproved { .. } => "stage_approved",
        TransitionEvent::StageRejected { .. } => "stage_rejected",
        TransitionEvent::StageChangesRequested { .. } => "stage_changes_requested",
    }
}

/// Builds the [`JobOutcome::ApplyPatches`] variant from a completed
/// `apply_patches` job's result payload.
#[must_use]
pub fn apply_patches_outcome(result: &serde_json::Value) -> JobOutcome {
    let pull_request = result.get("pullRequest").and_then(|value| {
        let number = value.get("number")?.as_u64()?;
        let url = value.get("url")?.as_str()?.to_owned();
        Some(PullRequestRef { number, url })
    });
    JobOutcome::ApplyPatches { pull_request }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use changegate_core::identifiers::ArtifactId;
    use changegate_core::identifiers::PatchSetId;
    use changegate_core::identifiers::StageName;
    use changegate_core::interfaces::QueueError;
    use changegate_core::interfaces::StoreError;
    use changegate_core::model::Artifact;
    use changegate_core::model::ArtifactKind;
    use changegate_core::model::PatchSet;
    use changegate_core::model::PolicyViolation;
    use changegate_core::model::Repo;
    use changegate_core::model::StageStatus;
    use changegate_core::model::WorkflowRun;
    use changegate_core::model::WorkflowState;
    use serde_json::Value;
    use std::sync::Mutex as StdSyncMutex;

    use super::*;

    #[derive(Default)]
    struct FakeStore {
        workflows: StdSyncMutex<HashMap<String, Workflow>>,
        events: StdSyncMutex<Vec<WorkflowEvent>>,
        approvals: StdSyncMutex<Vec<Approval>>,
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
            Ok(None)
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
        enqueued: StdSyncMutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Queues for FakeQueues {
        async fn enqueue(&self, queue: &str, payload: Value, _options: EnqueueOptions) -> Result<(), QueueError> {
            self.enqueued.lock().expect("lock").push((queue.to_owned(), payload));
            Ok(())
        }
    }

    fn workflow(now: Timestamp) -> Workflow {
        Workflow {
            id: WorkflowId::new("wf-1"),
            state: WorkflowState::Ingested,
            stage: StageName::Ingest,
            stage_status: StageStatus::Pending,
            feature_goal: "add widgets".to_owned(),
            business_justification: "customer ask".to_owned(),
            repos: vec![Repo { owner: "acme".to_owned(), name: "widgets".to_owned(), base_branch: "main".to_owned(), role: "primary".to_owned() }],
            feedback: None,
            created_at: now,
            updated_at: now,
            base_sha: None,
        }
    }

    #[tokio::test]
    async fn create_workflow_enqueues_ingest_context() {
        let store = Arc::new(FakeStore::default());
        let queues = Arc::new(FakeQueues::default());
        let orchestrator = Orchestrator::new(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&queues) as Arc<dyn Queues>);
        let now = Timestamp::from_unix_millis(1_000);

        let decision = orchestrator.create_workflow(workflow(now), now).await.expect("commits");
        assert_eq!(decision.next_state, WorkflowState::Ingested);
        let enqueued = queues.enqueued.lock().expect("lock");
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].1["workflowId"], "wf-1");
    }

    #[tokio::test]
    async fn ingest_completion_without_patch_sets_moves_to_needs_human() {
        let store = Arc::new(FakeStore::default());
        let queues = Arc::new(FakeQueues::default());
        let now = Timestamp::from_unix_millis(1_000);
        store.insert_workflow(&workflow(now)).await.expect("insert");
        let orchestrator = Orchestrator::new(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&queues) as Arc<dyn Queues>);

        let decision = orchestrator
            .record_job_completed(&WorkflowId::new("wf-1"), JobName::new("ingest_context"), JobOutcome::IngestContext, now)
            .await
            .expect("commits");
        assert_eq!(decision.next_state, WorkflowState::NeedsHuman);
    }

    #[tokio::test]
    async fn request_changes_records_feedback_on_the_workflow() {
        let store = Arc::new(FakeStore::default());
        let queues = Arc::new(FakeQueues::default());
        let now = Timestamp::from_unix_millis(1_000);
        store.insert_workflow(&workflow(now)).await.expect("insert");
        let orchestrator = Orchestrator::new(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&queues) as Arc<dyn Queues>);

        orchestrator.request_changes(&WorkflowId::new("wf-1"), "please add tests".to_owned(), now).await.expect("commits");
        let updated = store.load_workflow(&WorkflowId::new("wf-1")).await.expect("loads");
        assert_eq!(updated.feedback.as_deref(), Some("please add tests"));
    }

    #[test]
    fn apply_patches_outcome_parses_a_pull_request() {
        let result = serde_json::json!({ "pullRequest": { "number": 7, "url": "https://example.invalid/pr/7" } });
        let outcome = apply_patches_outcome(&result);
        assert_eq!(outcome, JobOutcome::ApplyPatches { pull_request: Some(PullRequestRef { number: 7, url: "https://example.invalid/pr/7".to_owned() }) });
    }

    #[test]
    fn apply_patches_outcome_handles_a_missing_pull_request() {
        let result = serde_json::json!({});
        let outcome = apply_patches_outcome(&result);
        assert_eq!(outcome, JobOutcome::ApplyPatches { pull_request: None });
    }
}

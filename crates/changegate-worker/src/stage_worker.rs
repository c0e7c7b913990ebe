// crates/changegate-worker/src/stage_worker.rs
// ============================================================================
// Module: Stage Worker Framework
// Description: The ten-step process(job) contract shared by every stage
//              worker; only artifact production differs per stage.
// Purpose: Make the run bookkeeping, hashing/versioning, event emission, and
//          failure path framework code, so an individual stage cannot
//          accidentally skip it.
// Dependencies: changegate-core
// ============================================================================

//! ## Overview
//! [`StageWorker`] is the one-method seam a concrete stage implements:
//! [`StageWorker::process_artifact`] receives the gathered stage inputs and
//! returns the stage's artifact content as a JSON value. Everything else —
//! loading the workflow, opening and closing the run record, computing the
//! next artifact version, persisting it, flipping `stage_status`, emitting
//! the completion/failure event, and publishing `E_JOB_COMPLETED` /
//! `E_JOB_FAILED` onto the orchestrator queue — is [`run_stage_job`], shared
//! across every stage.

use std::sync::Arc;

use async_trait::async_trait;
use changegate_core::hashing::hash_canonical_json;
use changegate_core::identifiers::ArtifactId;
use changegate_core::identifiers::EventId;
use changegate_core::identifiers::JobName;
use changegate_core::identifiers::QueueName;
use changegate_core::identifiers::RunId;
use changegate_core::identifiers::StageName;
use changegate_core::identifiers::WorkflowId;
use changegate_core::interfaces::EnqueueOptions;
use changegate_core::interfaces::Queues;
use changegate_core::interfaces::Store;
use changegate_core::interfaces::StoreError;
use changegate_core::model::Artifact;
use changegate_core::model::ArtifactKind;
use changegate_core::model::StageStatus;
use changegate_core::model::Workflow;
use changegate_core::model::WorkflowEvent;
use changegate_core::time::Timestamp;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;

use crate::run_recorder::RunRecorder;

/// Errors raised while running a stage job through the framework.
#[derive(Debug, Error)]
pub enum StageJobError {
    /// The job's workflow does not exist.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    /// The concrete stage's artifact-production step failed.
    #[error("artifact production failed: {0}")]
    ArtifactProduction(String),
    /// A store operation failed.
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

/// The gathered inputs a stage worker needs: prior artifacts, repo-context
/// summaries, and user feedback, assembled by the framework before
/// [`StageWorker::process_artifact`] runs.
#[derive(Debug, Clone)]
pub struct StageInputs {
    /// The workflow this job belongs to.
    pub workflow: Workflow,
    /// The latest artifact of each kind relevant to this stage, if any.
    pub prior_artifacts: Vec<Artifact>,
    /// The raw job payload, for stage-specific fields beyond `workflowId`.
    pub payload: Value,
}

/// The one method a concrete stage implements.
#[async_trait]
pub trait StageWorker: Send + Sync {
    /// The stage this worker is bound to.
    fn stage(&self) -> StageName;

    /// The artifact kind this stage produces.
    fn artifact_kind(&self) -> ArtifactKind;

    /// Produces the stage's artifact content from `inputs`.
    ///
    /// # Errors
    ///
    /// Returns a human-readable error message; the framework records it on
    /// the run and workflow and re-raises as [`StageJobError::ArtifactProduction`].
    async fn process_artifact(&self, inputs: &StageInputs) -> Result<Value, String>;
}

/// Runs the ten-step stage worker contract for one job.
///
/// # Errors
///
/// Returns [`StageJobError`] if the workflow cannot be loaded or a store
/// operation fails; artifact-production failures are recorded on the run
/// and workflow and returned as [`StageJobError::ArtifactProduction`] for
/// the caller's retry/backoff policy to handle.
#[allow(clippy::too_many_arguments, reason = "the ten-step contract genuinely takes this many collaborators")]
pub async fn run_stage_job(
    worker: &dyn StageWorker,
    store: &Arc<dyn Store>,
    queues: &Arc<dyn Queues>,
    run_recorder: &RunRecorder,
    workflow_id: WorkflowId,
    run_id: RunId,
    job_name: JobName,
    payload: Value,
    orchestrator_queue: &QueueName,
    now: Timestamp,
) -> Result<(), StageJobError> {
    let mut workflow = store
        .load_workflow(&workflow_id)
        .await
        .map_err(|_| StageJobError::WorkflowNotFound(workflow_id.as_str().to_owned()))?;

    let run = run_recorder.start_run(run_id, workflow_id.clone(), job_name.clone(), payload.clone(), now).await?;

    workflow.stage_status = StageStatus::Processing;
    workflow.updated_at = now;
    store.update_workflow(&workflow).await?;

    let existing_artifact = store.latest_artifact(&workflow_id, worker.artifact_kind()).await?;
    let prior_artifacts = existing_artifact.clone().into_iter().collect();
    let inputs = StageInputs { workflow: workflow.clone(), prior_artifacts, payload };

    match worker.process_artifact(&inputs).await {
        Ok(content) => {
            let artifact = persist_artifact(store, &workflow_id, worker.artifact_kind(), existing_artifact, &content, now).await?;
            workflow.stage_status = StageStatus::Ready;
            workflow.updated_at = now;
            store.update_workflow(&workflow).await?;

            let summary = json!({ "artifactId": artifact.id.as_str(), "artifactVersion": artifact.artifact_version });
            append_event(store, &workflow_id, &format!("worker.{}.completed", worker.stage()), summary.clone(), now).await?;
            run_recorder.complete_run(run, summary.clone(), None, now).await?;

            let job_payload = json!({ "workflowId": workflow_id.as_str(), "stage": worker.stage().as_str(), "result": summary });
            queues
                .enqueue(orchestrator_queue.as_str(), job_payload, EnqueueOptions { idempotency_key: Some(format!("{workflow_id}:{job_name}:completed")) })
                .await
                .map_err(|err| StageJobError::Store(StoreError::Transient(err.to_string())))?;
            Ok(())
        }
        Err(message) => {
            workflow.stage_status = StageStatus::Blocked;
            workflow.updated_at = now;
            store.update_workflow(&workflow).await?;

            append_event(store, &workflow_id, &format!("worker.{}.failed", worker.stage()), json!({ "error": message }), now).await?;
            run_recorder.fail_run(run, message.clone(), now).await?;

            let job_payload = json!({ "workflowId": workflow_id.as_str(), "stage": worker.stage().as_str(), "error": message });
            let _ = queues
                .enqueue(orchestrator_queue.as_str(), job_payload, EnqueueOptions { idempotency_key: Some(format!("{workflow_id}:{job_name}:failed")) })
                .await;
            Err(StageJobError::ArtifactProduction(message))
        }
    }
}

/// Canonicalizes, hashes, and persists `content` as the next version of
/// `kind` for `workflow_id`, given the `existing` latest artifact of that
/// kind (if any) already loaded by the caller.
async fn persist_artifact(
    store: &Arc<dyn Store>,
    workflow_id: &WorkflowId,
    kind: ArtifactKind,
    existing: Option<Artifact>,
    content: &Value,
    now: Timestamp,
) -> Result<Artifact, StoreError> {
    let digest = hash_canonical_json(content).map_err(|err| StoreError::Invalid(err.to_string()))?;
    let next_version = existing.as_ref().map_or(1, |artifact| artifact.artifact_version + 1);
    let artifact = Artifact {
        id: ArtifactId::new(format!("{workflow_id}:{kind:?}:{next_version}")),
        workflow_id: workflow_id.clone(),
        kind,
        content: content.to_string(),
        content_sha: digest.value,
        artifact_version: next_version,
        supersedes_artifact_id: existing.map(|artifact| artifact.id),
        created_at: now,
    };
    store.insert_artifact(&artifact).await?;
    Ok(artifact)
}

/// Appends a [`WorkflowEvent`] with a fresh id derived from the workflow and
/// timestamp.
async fn append_event(store: &Arc<dyn Store>, workflow_id: &WorkflowId, event_type: &str, payload: Value, now: Timestamp) -> Result<(), StoreError> {
    let event = WorkflowEvent {
        id: EventId::new(format!("{workflow_id}:{event_type}:{}", now.as_unix_millis())),
        workflow_id: workflow_id.clone(),
        event_type: event_type.to_owned(),
        payload,
        recorded_at: now,
    };
    store.append_event(&event).await
}

/// A job that drives a `WorkflowState`-level transition rather than the
/// `stage`/`stageStatus`-gated pipeline: `ingest_context` and
/// `apply_patches` run automatically once enqueued, with no artifact row
/// and no human approval gate of their own.
#[async_trait]
pub trait JobWorker: Send + Sync {
    /// The job name this worker handles (e.g. `"ingest_context"`).
    fn job_name(&self) -> &str;

    /// Runs the job, returning a result payload for the completion event.
    ///
    /// # Errors
    ///
    /// Returns a human-readable error message; the framework records it on
    /// the run and re-raises as [`StageJobError::ArtifactProduction`].
    async fn run(&self, inputs: &StageInputs) -> Result<Value, String>;
}

/// Runs a [`JobWorker`]: load workflow, open a run, execute, append a
/// completion/failure event, close the run, publish to the orchestrator
/// queue. No `stageStatus` transition and no artifact row, unlike
/// [`run_stage_job`].
///
/// # Errors
///
/// See [`run_stage_job`]; the same error cases apply, minus artifact
/// persistence.
pub async fn run_job(
    worker: &dyn JobWorker,
    store: &Arc<dyn Store>,
    queues: &Arc<dyn Queues>,
    run_recorder: &RunRecorder,
    workflow_id: WorkflowId,
    run_id: RunId,
    job_name: JobName,
    payload: Value,
    orchestrator_queue: &QueueName,
    now: Timestamp,
) -> Result<(), StageJobError> {
    let workflow = store
        .load_workflow(&workflow_id)
        .await
        .map_err(|_| StageJobError::WorkflowNotFound(workflow_id.as_str().to_owned()))?;
    let run = run_recorder.start_run(run_id, workflow_id.clone(), job_name.clone(), payload.clone(), now).await?;
    let inputs = StageInputs { workflow, prior_artifacts: Vec::new(), payload };

    match worker.run(&inputs).await {
        Ok(result) => {
            append_event(store, &workflow_id, &format!("worker.{}.completed", worker.job_name()), result.clone(), now).await?;
            run_recorder.complete_run(run, result.clone(), None, now).await?;
            let job_payload = json!({ "workflowId": workflow_id.as_str(), "stage": worker.job_name(), "result": result });
            queues
                .enqueue(orchestrator_queue.as_str(), job_payload, EnqueueOptions { idempotency_key: Some(format!("{workflow_id}:{job_name}:completed")) })
                .await
                .map_err(|err| StageJobError::Store(StoreError::Transient(err.to_string())))?;
            Ok(())
        }
        Err(message) => {
            append_event(store, &workflow_id, &format!("worker.{}.failed", worker.job_name()), json!({ "error": message }), now).await?;
            run_recorder.fail_run(run, message.clone(), now).await?;
            let job_payload = json!({ "workflowId": workflow_id.as_str(), "stage": worker.job_name(), "error": message });
            let _ = queues
                .enqueue(orchestrator_queue.as_str(), job_payload, EnqueueOptions { idempotency_key: Some(format!("{workflow_id}:{job_name}:failed")) })
                .await;
            Err(StageJobError::ArtifactProduction(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use changegate_core::identifiers::PatchSetId;
    use changegate_core::model::Approval;
    use changegate_core::model::PatchSet;
    use changegate_core::model::PolicyViolation;
    use changegate_core::model::Repo;
    use changegate_core::model::WorkflowState;

    use super::*;

    /// A single-threaded in-memory `Store`, sufficient to exercise
    /// [`run_stage_job`] without a real database.
    #[derive(Default)]
    struct TestStore {
        workflows: Mutex<HashMap<String, Workflow>>,
        artifacts: Mutex<Vec<Artifact>>,
        events: Mutex<Vec<WorkflowEvent>>,
        runs: Mutex<HashMap<String, WorkflowRun>>,
    }

    #[async_trait]
    impl Store for TestStore {
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

        async fn insert_artifact(&self, artifact: &Artifact) -> Result<(), StoreError> {
            self.artifacts.lock().expect("lock").push(artifact.clone());
            Ok(())
        }

        async fn latest_artifact(&self, workflow_id: &WorkflowId, kind: ArtifactKind) -> Result<Option<Artifact>, StoreError> {
            let artifacts = self.artifacts.lock().expect("lock");
            Ok(artifacts
                .iter()
                .filter(|artifact| &artifact.workflow_id == workflow_id && artifact.kind == kind)
                .max_by_key(|artifact| artifact.artifact_version)
                .cloned())
        }

        async fn load_artifact(&self, id: &ArtifactId) -> Result<Artifact, StoreError> {
            self.artifacts
                .lock()
                .expect("lock")
                .iter()
                .find(|artifact| &artifact.id == id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.as_str().to_owned()))
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

        async fn start_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
            self.runs.lock().expect("lock").insert(run.id.as_str().to_owned(), run.clone());
            Ok(())
        }

        async fn update_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
            self.runs.lock().expect("lock").insert(run.id.as_str().to_owned(), run.clone());
            Ok(())
        }

        async fn find_runs_by_input_hash(&self, input_hash: &str) -> Result<Vec<WorkflowRun>, StoreError> {
            Ok(self.runs.lock().expect("lock").values().filter(|run| run.input_hash == input_hash).cloned().collect())
        }

        async fn with_workflow_lock<'a>(&'a self, _workflow_id: &'a WorkflowId, f: Box<dyn FnOnce() -> Result<(), StoreError> + Send + 'a>) -> Result<(), StoreError> {
            f()
        }
    }

    /// An in-memory `Queues` that records every enqueued payload.
    #[derive(Default)]
    struct TestQueues {
        enqueued: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Queues for TestQueues {
        async fn enqueue(&self, queue: &str, payload: Value, _options: EnqueueOptions) -> Result<(), changegate_core::interfaces::QueueError> {
            self.enqueued.lock().expect("lock").push((queue.to_owned(), payload));
            Ok(())
        }
    }

    struct EchoWorker {
        kind: ArtifactKind,
        fail: bool,
    }

    #[async_trait]
    impl StageWorker for EchoWorker {
        fn stage(&self) -> StageName {
            StageName::Feasibility
        }

        fn artifact_kind(&self) -> ArtifactKind {
            self.kind
        }

        async fn process_artifact(&self, inputs: &StageInputs) -> Result<Value, String> {
            if self.fail {
                return Err("simulated failure".to_owned());
            }
            Ok(json!({ "echoed": inputs.payload.clone() }))
        }
    }

    fn test_workflow(id: &str, now: Timestamp) -> Workflow {
        Workflow {
            id: WorkflowId::new(id),
            state: WorkflowState::Ingested,
            stage: StageName::Feasibility,
            stage_status: StageStatus::Pending,
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
    async fn successful_job_persists_artifact_and_completes_run() {
        let now = Timestamp::from_unix_millis(1_000);
        let workflow = test_workflow("wf-1", now);
        let store: Arc<dyn Store> = Arc::new(TestStore::default());
        store.insert_workflow(&workflow).await.expect("insert");
        let queues: Arc<dyn Queues> = Arc::new(TestQueues::default());
        let run_recorder = RunRecorder::new(Arc::clone(&store));
        let worker = EchoWorker { kind: ArtifactKind::FeasibilityV1, fail: false };

        run_stage_job(
            &worker,
            &store,
            &queues,
            &run_recorder,
            workflow.id.clone(),
            RunId::new("run-1"),
            JobName::new("produce_feasibility"),
            json!({ "goal": "add widgets" }),
            &QueueName::new("orchestrator"),
            now,
        )
        .await
        .expect("job succeeds");

        let updated = store.load_workflow(&workflow.id).await.expect("loads");
        assert_eq!(updated.stage_status, StageStatus::Ready);

        let artifact = store.latest_artifact(&workflow.id, ArtifactKind::FeasibilityV1).await.expect("loads").expect("present");
        assert_eq!(artifact.artifact_version, 1);
        assert!(artifact.supersedes_artifact_id.is_none());
    }

    #[tokio::test]
    async fn second_run_supersedes_the_first_artifact() {
        let now = Timestamp::from_unix_millis(2_000);
        let workflow = test_workflow("wf-2", now);
        let store: Arc<dyn Store> = Arc::new(TestStore::default());
        store.insert_workflow(&workflow).await.expect("insert");
        let queues: Arc<dyn Queues> = Arc::new(TestQueues::default());
        let run_recorder = RunRecorder::new(Arc::clone(&store));
        let worker = EchoWorker { kind: ArtifactKind::FeasibilityV1, fail: false };

        for index in 0..2 {
            run_stage_job(
                &worker,
                &store,
                &queues,
                &run_recorder,
                workflow.id.clone(),
                RunId::new(format!("run-{index}")),
                JobName::new("produce_feasibility"),
                json!({ "attempt": index }),
                &QueueName::new("orchestrator"),
                now,
            )
            .await
            .expect("job succeeds");
        }

        let artifact = store.latest_artifact(&workflow.id, ArtifactKind::FeasibilityV1).await.expect("loads").expect("present");
        assert_eq!(artifact.artifact_version, 2);
        assert!(artifact.supersedes_artifact_id.is_some());
    }

    #[tokio::test]
    async fn failed_job_blocks_stage_and_publishes_failure_event() {
        let now = Timestamp::from_unix_millis(3_000);
        let workflow = test_workflow("wf-3", now);
        let store: Arc<dyn Store> = Arc::new(TestStore::default());
        store.insert_workflow(&workflow).await.expect("insert");
        let queues: Arc<dyn Queues> = Arc::new(TestQueues::default());
        let run_recorder = RunRecorder::new(Arc::clone(&store));
        let worker = EchoWorker { kind: ArtifactKind::FeasibilityV1, fail: true };

        let result = run_stage_job(
            &worker,
            &store,
            &queues,
            &run_recorder,
            workflow.id.clone(),
            RunId::new("run-1"),
            JobName::new("produce_feasibility"),
            json!({}),
            &QueueName::new("orchestrator"),
            now,
        )
        .await;

        assert!(matches!(result, Err(StageJobError::ArtifactProduction(_))));
        let updated = store.load_workflow(&workflow.id).await.expect("loads");
        assert_eq!(updated.stage_status, StageStatus::Blocked);

        let events = store.list_events(&workflow.id).await.expect("loads");
        assert!(events.iter().any(|event| event.event_type == "worker.feasibility.failed"));
    }
}

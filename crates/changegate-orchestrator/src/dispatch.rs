// crates/changegate-orchestrator/src/dispatch.rs
// ============================================================================
// Module: Orchestrator Queue Dispatch
// Description: Turns a completed/failed worker job payload, delivered on the
//              `"orchestrator"` queue, into the matching `Orchestrator`
//              record_* call; drives the consuming run loop.
// Purpose: The one place that interprets the shared `"stage"` JSON key
//          `run_stage_job`/`run_job` both publish under.
// Dependencies: changegate-broker, changegate-core, tokio-stream
// ============================================================================

//! ## Overview
//! Both [`changegate_worker::stage_worker::run_stage_job`] and
//! [`changegate_worker::stage_worker::run_job`] publish
//! `{"workflowId", "stage", "result"}` / `{"workflowId", "stage", "error"}`
//! onto the orchestrator queue, reusing the `"stage"` key for either a
//! [`StageName`] (an ordinary gated stage's artifact production finished) or
//! a job name (`ingest_context`, `evaluate_policy`, `apply_patches`). Job
//! names are matched explicitly because those three jobs are the only ones
//! [`transition`] branches on directly; everything else is an ordinary
//! gated-stage completion, which has no `WorkflowState` effect of its own —
//! it only ever advances through a human calling
//! [`crate::Orchestrator::approve_stage`] — so [`dispatch`] acknowledges it
//! without calling [`transition`].

use changegate_broker::Job;
use changegate_core::identifiers::JobName;
use changegate_core::identifiers::WorkflowId;
use changegate_core::transition::JobOutcome;
use changegate_core::transition::TransitionDecision;
use serde_json::Value;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::OrchestratorError;
use crate::orchestrator::Orchestrator;
use crate::orchestrator::apply_patches_outcome;

/// Job names [`transition`] interprets directly; any other `"stage"` value
/// is an ordinary gated stage's artifact-production completion.
const INGEST_CONTEXT: &str = "ingest_context";
const EVALUATE_POLICY: &str = "evaluate_policy";
const APPLY_PATCHES: &str = "apply_patches";

/// Interprets one orchestrator-queue payload and drives the matching
/// transition, if any.
///
/// # Errors
///
/// Returns [`OrchestratorError`] if the payload is malformed or the
/// underlying transition fails to commit.
pub async fn dispatch(orchestrator: &Orchestrator, payload: &Value, now: changegate_core::time::Timestamp) -> Result<Option<TransitionDecision>, OrchestratorError> {
    let workflow_id = payload
        .get("workflowId")
        .and_then(Value::as_str)
        .map(WorkflowId::new)
        .ok_or_else(|| OrchestratorError::InvalidStageTransition("job payload missing workflowId".to_owned()))?;
    let stage = payload
        .get("stage")
        .and_then(Value::as_str)
        .ok_or_else(|| OrchestratorError::InvalidStageTransition("job payload missing stage".to_owned()))?;

    match stage {
        INGEST_CONTEXT => dispatch_job_outcome(orchestrator, &workflow_id, JobName::new(INGEST_CONTEXT), payload, now, |_| JobOutcome::IngestContext).await.map(Some),
        APPLY_PATCHES => dispatch_job_outcome(orchestrator, &workflow_id, JobName::new(APPLY_PATCHES), payload, now, apply_patches_outcome).await.map(Some),
        EVALUATE_POLICY => dispatch_evaluate_policy(orchestrator, &workflow_id, payload, now).await.map(Some),
        _ => Ok(None),
    }
}

/// Handles a completed/failed job whose result, on success, converts into a
/// [`JobOutcome`] via `to_outcome`.
async fn dispatch_job_outcome(
    orchestrator: &Orchestrator,
    workflow_id: &WorkflowId,
    job: JobName,
    payload: &Value,
    now: changegate_core::time::Timestamp,
    to_outcome: impl FnOnce(&Value) -> JobOutcome,
) -> Result<TransitionDecision, OrchestratorError> {
    if let Some(error) = payload.get("error").and_then(Value::as_str) {
        return orchestrator.record_job_failed(workflow_id, job, error.to_owned(), now).await;
    }
    let result = payload.get("result").cloned().unwrap_or(Value::Null);
    orchestrator.record_job_completed(workflow_id, job, to_outcome(&result), now).await
}

/// Handles an `evaluate_policy` completion/failure, reading
/// `hasBlockingViolations` out of the result rather than building a
/// [`JobOutcome`] (the transition function reacts to `PolicyEvaluated`
/// directly, not to a `JobCompleted { job: "evaluate_policy", .. }` event).
async fn dispatch_evaluate_policy(orchestrator: &Orchestrator, workflow_id: &WorkflowId, payload: &Value, now: changegate_core::time::Timestamp) -> Result<TransitionDecision, OrchestratorError> {
    if let Some(error) = payload.get("error").and_then(Value::as_str) {
        return orchestrator.record_job_failed(workflow_id, JobName::new(EVALUATE_POLICY), error.to_owned(), now).await;
    }
    let has_blocking_violations = payload.get("result").and_then(|result| result.get("hasBlockingViolations")).and_then(Value::as_bool).unwrap_or(false);
    orchestrator.record_policy_evaluated(workflow_id, has_blocking_violations, now).await
}

/// Consumes `stream` until the publisher drops its sender, dispatching each
/// job in turn. A dispatch failure is returned to the caller rather than
/// silently swallowed; callers decide whether to log-and-continue or abort
/// the loop.
///
/// # Errors
///
/// Returns the first [`OrchestratorError`] any dispatched job produces.
pub async fn run_dispatch_loop(orchestrator: &Orchestrator, mut stream: ReceiverStream<Job>, now: impl Fn() -> changegate_core::time::Timestamp) -> Result<(), OrchestratorError> {
    while let Some(job) = stream.next().await {
        dispatch(orchestrator, &job.payload, now()).await?;
    }
    Ok(())
}

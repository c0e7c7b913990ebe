// crates/changegate-core/src/transition.rs
// ============================================================================
// Module: Transition Function
// Description: Pure deterministic workflow state machine.
// Purpose: Map (current_state, event, context) to (next_state, jobs, reason)
//          with no I/O of any kind.
// Dependencies: crate::identifiers, crate::model, serde, serde_json
// ============================================================================

//! ## Overview
//! `transition` is the only place workflow-level control flow is decided.
//! It never touches a clock or a store; every fact it needs is either in the
//! event or pre-computed into [`TransitionContext`] by the orchestrator. This
//! is what makes the function trivially testable and safe to call twice with
//! the same inputs.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::identifiers::JobName;
use crate::identifiers::PatchSetId;
use crate::identifiers::QueueName;
use crate::identifiers::StageName;
use crate::identifiers::WorkflowId;
use crate::model::WorkflowState;

/// The queue every orchestrator-originated job is published to. Stage
/// workers each subscribe to the job names relevant to them.
const WORKFLOW_QUEUE: &str = "workflow";

/// The well-known error string the Write Gate raises when a write is
/// attempted without a recorded `apply_patches` approval.
pub const WRITE_BLOCKED_NO_APPROVAL: &str = "WRITE_BLOCKED_NO_APPROVAL";

// ============================================================================
// SECTION: Events
// ============================================================================

/// A reference to an opened pull request, carried by a completed
/// `apply_patches` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    /// The pull request number.
    pub number: u64,
    /// The pull request URL.
    pub url: String,
}

/// The result payload of a completed job, interpreted only for the jobs the
/// transition function cares about; all other jobs carry an opaque value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobOutcome {
    /// The `ingest_context` job completed; relevant facts live in
    /// [`TransitionContext::has_patch_sets`].
    IngestContext,
    /// The `apply_patches` job completed, optionally opening a pull request.
    ApplyPatches {
        /// The opened pull request, if the host returned one.
        pull_request: Option<PullRequestRef>,
    },
    /// Any other job; its result carries no transition-relevant meaning.
    Other(Value),
}

/// The conclusion of a CI run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiConclusion {
    /// CI succeeded.
    Success,
    /// CI failed.
    Failure,
}

/// An event delivered to the transition function.
///
/// # Invariants
/// - Carries only the facts the originating system actually observed;
///   derived facts belong on [`TransitionContext`], not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransitionEvent {
    /// A new workflow was created.
    WorkflowCreated,
    /// A job completed.
    JobCompleted {
        /// The job that completed.
        job: JobName,
        /// The job's result.
        result: JobOutcome,
    },
    /// A job failed.
    JobFailed {
        /// The job that failed.
        job: JobName,
        /// The error message.
        error: String,
    },
    /// A human recorded an approval for the patches gate.
    ApprovalRecorded,
    /// Gate2 finished evaluating the latest PatchSet.
    PolicyEvaluated {
        /// Whether the evaluation produced at least one BLOCK violation.
        has_blocking_violations: bool,
    },
    /// CI finished running against the open pull request.
    CiCompleted {
        /// CI's conclusion.
        conclusion: CiConclusion,
    },
    /// The pull request was merged.
    PrMerged,
    /// The pull request was closed without merging.
    PrClosed,
    /// A human requested changes at the workflow level.
    ChangesRequested {
        /// The human's comment.
        comment: String,
    },
    /// A human rejected the latest PatchSet.
    PatchSetRejected {
        /// The rejection reason.
        reason: String,
    },
    /// A human approved the current gated stage.
    StageApproved {
        /// The stage being approved.
        stage: StageName,
        /// The stage to advance into.
        next_stage: StageName,
    },
    /// A human rejected the current gated stage.
    StageRejected {
        /// The stage being rejected.
        stage: StageName,
        /// The rejection reason.
        reason: String,
    },
    /// A human requested changes to the current gated stage.
    StageChangesRequested {
        /// The stage changes were requested on.
        stage: StageName,
        /// The requested-changes reason.
        reason: String,
    },
}

// ============================================================================
// SECTION: Context
// ============================================================================

/// Facts the orchestrator derives from the store before calling
/// [`transition`]. The function itself never queries anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionContext {
    /// The workflow this transition concerns.
    pub workflow_id: WorkflowId,
    /// Whether the workflow has at least one PatchSet.
    pub has_patch_sets: bool,
    /// The most recent PatchSet, if any.
    pub latest_patch_set_id: Option<PatchSetId>,
    /// Whether an `apply_patches` approval exists for the latest PatchSet.
    pub has_approval_to_apply: bool,
    /// Whether the latest PatchSet has at least one BLOCK violation.
    pub has_blocking_policy_violations: bool,
    /// Whether Gate2 has evaluated the latest PatchSet at all.
    pub has_policy_been_evaluated: bool,
}

// ============================================================================
// SECTION: Decision
// ============================================================================

/// A job the orchestrator must enqueue as part of committing a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueuedJob {
    /// The destination queue.
    pub queue: QueueName,
    /// The job name.
    pub name: JobName,
    /// The job payload.
    pub payload: Value,
}

/// The result of a single call to [`transition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDecision {
    /// The workflow's next state.
    pub next_state: WorkflowState,
    /// Jobs to enqueue as part of this transition, in order.
    pub enqueue: Vec<EnqueuedJob>,
    /// A short human-readable reason, for the emitted `WorkflowEvent`.
    pub reason: &'static str,
}

impl TransitionDecision {
    /// Builds a decision that stays in `state` and enqueues nothing.
    fn identity(state: WorkflowState, reason: &'static str) -> Self {
        Self {
            next_state: state,
            enqueue: Vec::new(),
            reason,
        }
    }
}

fn enqueue_job(workflow_id: &WorkflowId, name: &str, mut payload: Value) -> EnqueuedJob {
    if let Value::Object(map) = &mut payload {
        map.insert(
            "workflowId".to_owned(),
            Value::String(workflow_id.as_str().to_owned()),
        );
        // The "workflow" queue carries more than one job kind; a consumer
        // needs this to know which JobWorker to hand the delivery to,
        // since Queues::enqueue itself does not carry EnqueuedJob::name.
        map.insert("job".to_owned(), Value::String(name.to_owned()));
    }
    EnqueuedJob {
        queue: QueueName::new(WORKFLOW_QUEUE),
        name: JobName::new(name),
        payload,
    }
}

// ============================================================================
// SECTION: Transition function
// ============================================================================

/// Computes the next workflow state, the jobs to enqueue, and a reason, for
/// a single `(state, event, context)` triple.
///
/// Pure and total: the same inputs always produce the same decision, and no
/// branch performs I/O or reads the clock.
#[must_use]
pub fn transition(
    state: WorkflowState,
    event: &TransitionEvent,
    ctx: &TransitionContext,
) -> TransitionDecision {
    if state.is_terminal() {
        return TransitionDecision::identity(state, "terminal state is sticky");
    }

    if let TransitionEvent::PolicyEvaluated {
        has_blocking_violations: true,
    } = event
    {
        return TransitionDecision::identity(WorkflowState::BlockedPolicy, "blocking policy violation");
    }

    match state {
        WorkflowState::Ingested => ingested(event, ctx),
        WorkflowState::PatchesProposed => patches_proposed(ctx),
        WorkflowState::WaitingUserApproval => waiting_user_approval(event, ctx),
        WorkflowState::ApplyingPatches => applying_patches(event),
        WorkflowState::PrOpen => pr_open(event),
        WorkflowState::VerifyingCi => TransitionDecision::identity(state, "awaiting CI result"),
        WorkflowState::Done
        | WorkflowState::NeedsHuman
        | WorkflowState::BlockedPolicy
        | WorkflowState::Failed
        | WorkflowState::Rejected => TransitionDecision::identity(state, "terminal state is sticky"),
    }
}

fn ingested(event: &TransitionEvent, ctx: &TransitionContext) -> TransitionDecision {
    match event {
        TransitionEvent::WorkflowCreated => TransitionDecision {
            next_state: WorkflowState::Ingested,
            enqueue: vec![enqueue_job(&ctx.workflow_id, "ingest_context", json!({}))],
            reason: "workflow created, enqueued ingest",
        },
        TransitionEvent::JobCompleted { job, .. } if job.as_str() == "ingest_context" => {
            if ctx.has_patch_sets {
                TransitionDecision::identity(WorkflowState::PatchesProposed, "ingest produced patch sets")
            } else {
                TransitionDecision::identity(WorkflowState::NeedsHuman, "ingest produced no patch sets")
            }
        }
        TransitionEvent::JobFailed { job, .. } if job.as_str() == "ingest_context" => {
            TransitionDecision::identity(WorkflowState::Failed, "ingest job failed")
        }
        _ => TransitionDecision::identity(WorkflowState::Ingested, "no applicable rule"),
    }
}

/// `PATCHES_PROPOSED` is re-derived from context alone on any event; the
/// event type carries no information this state needs.
fn patches_proposed(ctx: &TransitionContext) -> TransitionDecision {
    if !ctx.has_patch_sets {
        return TransitionDecision::identity(WorkflowState::NeedsHuman, "no patch sets to evaluate");
    }
    if !ctx.has_policy_been_evaluated {
        let Some(patch_set_id) = &ctx.latest_patch_set_id else {
            return TransitionDecision::identity(WorkflowState::NeedsHuman, "no latest patch set id");
        };
        return TransitionDecision {
            next_state: WorkflowState::PatchesProposed,
            enqueue: vec![enqueue_job(
                &ctx.workflow_id,
                "evaluate_policy",
                json!({ "patchSetId": patch_set_id.as_str() }),
            )],
            reason: "enqueued policy evaluation",
        };
    }
    if ctx.has_blocking_policy_violations {
        return TransitionDecision::identity(WorkflowState::BlockedPolicy, "policy evaluation blocked");
    }
    TransitionDecision::identity(WorkflowState::WaitingUserApproval, "policy evaluation clean")
}

fn waiting_user_approval(event: &TransitionEvent, ctx: &TransitionContext) -> TransitionDecision {
    match event {
        TransitionEvent::ApprovalRecorded => {
            if ctx.has_blocking_policy_violations {
                return TransitionDecision::identity(WorkflowState::BlockedPolicy, "blocking violations present");
            }
            if ctx.has_approval_to_apply {
                if let Some(patch_set_id) = &ctx.latest_patch_set_id {
                    return TransitionDecision {
                        next_state: WorkflowState::ApplyingPatches,
                        enqueue: vec![enqueue_job(
                            &ctx.workflow_id,
                            "apply_patches",
                            json!({ "patchSetId": patch_set_id.as_str() }),
                        )],
                        reason: "approval recorded, applying patches",
                    };
                }
            }
            TransitionDecision::identity(WorkflowState::WaitingUserApproval, "approval recorded, not yet actionable")
        }
        TransitionEvent::PolicyEvaluated {
            has_blocking_violations: false,
        } => TransitionDecision::identity(WorkflowState::WaitingUserApproval, "re-evaluation stayed clean"),
        _ => TransitionDecision::identity(WorkflowState::WaitingUserApproval, "no applicable rule"),
    }
}

fn applying_patches(event: &TransitionEvent) -> TransitionDecision {
    match event {
        TransitionEvent::JobCompleted { job, result } if job.as_str() == "apply_patches" => match result {
            JobOutcome::ApplyPatches { pull_request: Some(_) } => {
                TransitionDecision::identity(WorkflowState::PrOpen, "pull request opened")
            }
            _ => TransitionDecision::identity(WorkflowState::ApplyingPatches, "apply_patches completed without a pull request"),
        },
        TransitionEvent::JobFailed { job, error } if job.as_str() == "apply_patches" => {
            if error == WRITE_BLOCKED_NO_APPROVAL {
                TransitionDecision::identity(WorkflowState::BlockedPolicy, "write blocked, no approval")
            } else {
                TransitionDecision::identity(WorkflowState::Failed, "apply_patches job failed")
            }
        }
        _ => TransitionDecision::identity(WorkflowState::ApplyingPatches, "no applicable rule"),
    }
}

fn pr_open(event: &TransitionEvent) -> TransitionDecision {
    match event {
        TransitionEvent::CiCompleted { conclusion: CiConclusion::Success } => {
            TransitionDecision::identity(WorkflowState::Done, "CI succeeded")
        }
        TransitionEvent::CiCompleted { conclusion: CiConclusion::Failure } => {
            TransitionDecision::identity(WorkflowState::NeedsHuman, "CI failed")
        }
        _ => TransitionDecision::identity(WorkflowState::PrOpen, "no applicable rule"),
    }
}

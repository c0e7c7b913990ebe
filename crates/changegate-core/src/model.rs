// crates/changegate-core/src/model.rs
// ============================================================================
// Module: Data Model
// Description: Workflow, Artifact, PatchSet, Patch, Approval, PolicyViolation,
//              WorkflowEvent, and WorkflowRun entities.
// Purpose: Semantic types for the workflow aggregate and its owned entities.
// Dependencies: crate::identifiers, crate::time, serde, serde_json
// ============================================================================

//! ## Overview
//! Workflow owns Artifacts, PatchSets, Approvals, PolicyViolations, Events,
//! and Runs. Cross-entity references (`supersedes_artifact_id`, `patch_set_id`
//! on violations, `workflow_id` everywhere) are lookup back-pointers, not
//! owning references; deletion (not a normal operation) cascades from
//! Workflow only.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::identifiers::AgentId;
use crate::identifiers::ApprovalId;
use crate::identifiers::ArtifactId;
use crate::identifiers::EventId;
use crate::identifiers::JobName;
use crate::identifiers::PatchId;
use crate::identifiers::PatchSetId;
use crate::identifiers::RunId;
use crate::identifiers::StageName;
use crate::identifiers::TaskId;
use crate::identifiers::ViolationId;
use crate::identifiers::WorkflowId;
use crate::time::Timestamp;

// ============================================================================
// SECTION: Workflow
// ============================================================================

/// Workflow-level control-flow label. Drives enqueue decisions in
/// [`crate::transition`].
///
/// # Invariants
/// - `Done`, `Failed`, `Rejected`, `BlockedPolicy`, `NeedsHuman` are terminal
///   (sticky): the transition function returns the same state for any event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// The feature request has been ingested into repo context.
    Ingested,
    /// A PatchSet has been proposed and is pending policy/approval.
    PatchesProposed,
    /// Waiting on a human `apply_patches` approval.
    WaitingUserApproval,
    /// The approved PatchSet is being applied to the code host.
    ApplyingPatches,
    /// A pull request is open and CI is pending.
    PrOpen,
    /// Verifying CI results for the open pull request.
    VerifyingCi,
    /// Terminal: the workflow completed successfully.
    Done,
    /// Terminal: requires human intervention to proceed.
    NeedsHuman,
    /// Terminal: blocked by a policy violation or a Write Gate refusal.
    BlockedPolicy,
    /// Terminal: a programmer/fatal error occurred.
    Failed,
    /// Terminal: a human rejected the workflow or a stage.
    Rejected,
}

impl WorkflowState {
    /// Returns whether this state is terminal (sticky under any event).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::NeedsHuman | Self::BlockedPolicy | Self::Failed | Self::Rejected
        )
    }
}

/// Per-stage progress label, advisory except when the orchestrator overwrites
/// it authoritatively on a state transition.
///
/// # Invariants
/// - Workers set this field; the orchestrator is the only writer of
///   `Workflow::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not yet started.
    Pending,
    /// A worker is currently producing the stage's artifact.
    Processing,
    /// The artifact is produced; awaiting human approval.
    Ready,
    /// The stage's gate was approved.
    Approved,
    /// The stage's gate was rejected.
    Rejected,
    /// The worker's run failed.
    Blocked,
    /// A human requested changes; feedback recorded, stage re-enqueued.
    NeedsChanges,
}

/// A target repository for a workflow's changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    /// Repository owner (organization or user).
    pub owner: String,
    /// Repository name.
    pub name: String,
    /// Base branch patches are applied against.
    pub base_branch: String,
    /// Role this repository plays in the workflow (e.g. `"primary"`).
    pub role: String,
}

/// The top-level aggregate: a single feature request moving through the
/// gated pipeline.
///
/// # Invariants
/// - `stage` and `state` move monotonically forward except into a terminal
///   state.
/// - Created on external request; never destroyed (audit log).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    /// Stable identifier.
    pub id: WorkflowId,
    /// Workflow-level control-flow state.
    pub state: WorkflowState,
    /// Current gated stage.
    pub stage: StageName,
    /// Progress label for the current stage.
    pub stage_status: StageStatus,
    /// The feature request being implemented.
    pub feature_goal: String,
    /// Business justification for the change.
    pub business_justification: String,
    /// Target repositories.
    pub repos: Vec<Repo>,
    /// Last change-request comment, if any.
    pub feedback: Option<String>,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Last-update timestamp.
    pub updated_at: Timestamp,
    /// Base commit SHA snapshot, once known.
    pub base_sha: Option<String>,
}

// ============================================================================
// SECTION: Artifact
// ============================================================================

/// The kind of a stage artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ArtifactKind {
    /// Output of the feasibility stage.
    FeasibilityV1,
    /// Output of the architecture stage.
    ArchitectureV1,
    /// Output of the timeline stage.
    TimelineV1,
    /// Output of the summary stage.
    SummaryV1,
    /// Output of the patches stage; backs a [`crate::model::PatchSet`].
    PatchSetV1,
    /// Output of the policy stage; a summary of the Gate2 verdict that
    /// produced the [`crate::model::PolicyViolation`] rows for the same
    /// PatchSet.
    PolicyV1,
    /// Output of the placeholder sandbox stage; records pass-through, no
    /// sandboxing behavior is implemented.
    SandboxV1,
    /// Output of the pr stage; the opened pull request's number and URL.
    PrV1,
}

/// An immutable, versioned output of a stage.
///
/// # Invariants
/// - Append-only: never mutated after creation.
/// - `artifact_version` is monotonic per `(workflow_id, kind)`.
/// - `content_sha` is the SHA-256 of the canonical `content` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Stable identifier.
    pub id: ArtifactId,
    /// Owning workflow.
    pub workflow_id: WorkflowId,
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// Canonical JSON content text.
    pub content: String,
    /// SHA-256 of the canonical content.
    pub content_sha: String,
    /// Monotonic version number per `(workflow_id, kind)`.
    pub artifact_version: u64,
    /// Previous latest artifact of the same kind, if any.
    pub supersedes_artifact_id: Option<ArtifactId>,
    /// Creation timestamp.
    pub created_at: Timestamp,
}

// ============================================================================
// SECTION: PatchSet / Patch
// ============================================================================

/// Lifecycle status of a `PatchSet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchSetStatus {
    /// Proposed, awaiting policy evaluation and/or approval.
    Proposed,
    /// Approved for application.
    Approved,
    /// Rejected by a human or by Gate2.
    Rejected,
}

/// An action performed on a file by a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    /// The file is newly created.
    Create,
    /// The file is modified in place.
    Modify,
    /// The file is deleted.
    Delete,
}

/// A risk classification self-reported by the proposing agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Low risk.
    Low,
    /// Medium risk.
    Medium,
    /// High risk; triggers a Gate2 WARN.
    High,
}

/// A single file touched by a patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchFileChange {
    /// Repository-relative file path.
    pub path: String,
    /// Action performed on the file.
    pub action: FileAction,
    /// Added line count.
    pub additions: u32,
    /// Removed line count.
    pub deletions: u32,
}

/// A single file-level change proposal, belonging to exactly one `PatchSet`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Stable identifier.
    pub id: PatchId,
    /// The task this patch implements, if tracked.
    pub task_id: Option<TaskId>,
    /// The specialist agent that proposed this patch, if known.
    pub proposed_by: Option<AgentId>,
    /// Short title.
    pub title: String,
    /// Human-readable summary.
    pub summary: String,
    /// Unified diff text.
    pub diff: String,
    /// Files touched by this patch.
    pub files: Vec<PatchFileChange>,
    /// Whether this patch adds or updates tests.
    pub adds_tests: bool,
    /// Self-reported risk level.
    pub risk_level: RiskLevel,
    /// Proposed shell commands (e.g. migrations), not executed automatically.
    pub proposed_commands: Vec<String>,
}

/// The artifact of the patches stage: a collection of file-level patches
/// sharing a base SHA.
///
/// # Invariants
/// - Backed by exactly one [`Artifact`] of kind [`ArtifactKind::PatchSetV1`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSet {
    /// Stable identifier.
    pub id: PatchSetId,
    /// Owning workflow.
    pub workflow_id: WorkflowId,
    /// Backing artifact row.
    pub artifact_id: ArtifactId,
    /// Short title, concatenated from contributing proposals when merged.
    pub title: String,
    /// Base commit SHA the patches apply against.
    pub base_sha: String,
    /// Lifecycle status.
    pub status: PatchSetStatus,
    /// Ordered list of patches.
    pub patches: Vec<Patch>,
}

// ============================================================================
// SECTION: Approval
// ============================================================================

/// The kind of a recorded approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    /// Approves applying the latest PatchSet (the patches-gate approval).
    ApplyPatches,
    /// Approves advancing out of an ordinary gated stage.
    StageApproval,
}

/// A human-recorded decision gating a stage transition.
///
/// # Invariants
/// - Immutable once recorded; consumed by exactly one forward transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    /// Stable identifier.
    pub id: ApprovalId,
    /// Owning workflow.
    pub workflow_id: WorkflowId,
    /// The stage this approval gates.
    pub stage: StageName,
    /// Approval kind.
    pub kind: ApprovalKind,
    /// Optional human-provided reason.
    pub reason: Option<String>,
    /// When the approval was recorded.
    pub recorded_at: Timestamp,
}

// ============================================================================
// SECTION: PolicyViolation
// ============================================================================

/// Severity of a policy finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Advisory; does not block the workflow.
    Warn,
    /// Blocks the workflow; requires human remediation.
    Block,
}

/// A single policy finding tied to a `PatchSet`.
///
/// # Invariants
/// - Re-derivable from the PatchSet's diff and the active policy
///   configuration.
/// - The stored set for a PatchSet is overwritten atomically on each
///   re-evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    /// Stable identifier.
    pub id: ViolationId,
    /// The PatchSet this violation was derived from.
    pub patch_set_id: PatchSetId,
    /// The rule that produced this finding (e.g. `"frozen_file"`).
    pub rule: String,
    /// Severity.
    pub severity: Severity,
    /// The file the finding concerns.
    pub file: String,
    /// The line the finding concerns, if applicable.
    pub line: Option<u32>,
    /// Human-readable message.
    pub message: String,
    /// Truncated evidence substring (never the full secret/line).
    pub evidence: String,
}

// ============================================================================
// SECTION: WorkflowEvent
// ============================================================================

/// An append-only audit record of something that happened to a workflow.
///
/// # Invariants
/// - Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Stable identifier.
    pub id: EventId,
    /// Owning workflow.
    pub workflow_id: WorkflowId,
    /// Event type string (e.g. `"worker.feasibility.completed"`).
    pub event_type: String,
    /// Arbitrary JSON payload.
    pub payload: Value,
    /// When the event was recorded.
    pub recorded_at: Timestamp,
}

// ============================================================================
// SECTION: WorkflowRun
// ============================================================================

/// Execution status of a `WorkflowRun`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run is in progress.
    Running,
    /// The run completed successfully.
    Completed,
    /// The run failed.
    Failed,
}

/// Token/cost usage recorded for an LLM-backed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UsageCounters {
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens produced.
    pub output_tokens: u64,
    /// Estimated cost in the provider's billing currency, in micro-units
    /// (1 unit = 1e-6 currency units) to avoid floating point drift.
    pub estimated_cost_micros: u64,
}

/// One recorded attempt at executing a stage's job; the unit of audit.
///
/// # Invariants
/// - `input_hash` is stable for identical `inputs` (see
///   [`crate::hashing::hash_canonical_json`]).
/// - Ends in exactly one of `Completed` or `Failed`; never left `Running`
///   once the owning task has exited (scoped-acquisition discipline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Stable identifier.
    pub id: RunId,
    /// Owning workflow.
    pub workflow_id: WorkflowId,
    /// The job name this run executed.
    pub job_name: JobName,
    /// Execution status.
    pub status: RunStatus,
    /// Canonical hash of `inputs`.
    pub input_hash: String,
    /// Raw inputs supplied to the job.
    pub inputs: Value,
    /// Outputs, present once `status == Completed`.
    pub outputs: Option<Value>,
    /// Error message, present once `status == Failed`.
    pub error_message: Option<String>,
    /// Start timestamp.
    pub started_at: Timestamp,
    /// Completion timestamp, present once terminal.
    pub completed_at: Option<Timestamp>,
    /// Duration in milliseconds, present once terminal.
    pub duration_ms: Option<u64>,
    /// Token/cost usage, present for LLM-backed stages.
    pub usage: Option<UsageCounters>,
}

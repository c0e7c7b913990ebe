// crates/changegate-core/src/interfaces.rs
// ============================================================================
// Module: External Interfaces
// Description: Capability traits the core requires from its effectful shell.
// Purpose: Keep the pure core's dependents behind narrow, testable seams;
//          every I/O-performing collaborator implements one of these.
// Dependencies: async-trait, serde_json, thiserror
// ============================================================================

//! ## Overview
//! Four traits cover every external collaborator named in this document:
//! an LLM backend, a code host, a relational store, and a job queue. None
//! of them is implemented in this crate; `changegate-providers`,
//! `changegate-store-sqlite`, and `changegate-broker` each implement one
//! (or more) against a concrete backend. Keeping the traits here, next to
//! the data model and the transition function, means `changegate-worker`
//! and `changegate-orchestrator` can depend on `changegate-core` alone and
//! stay agnostic to which backend is wired in.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::identifiers::ApprovalId;
use crate::identifiers::ArtifactId;
use crate::identifiers::EventId;
use crate::identifiers::PatchSetId;
use crate::identifiers::RunId;
use crate::identifiers::ViolationId;
use crate::identifiers::WorkflowId;
use crate::model::Approval;
use crate::model::Artifact;
use crate::model::ArtifactKind;
use crate::model::PatchSet;
use crate::model::PolicyViolation;
use crate::model::Workflow;
use crate::model::WorkflowEvent;
use crate::model::WorkflowRun;

// ============================================================================
// SECTION: LLMProvider
// ============================================================================

/// A chat message passed to an [`LLMProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmMessage {
    /// The message role (`"system"`, `"user"`, `"assistant"`).
    pub role: String,
    /// The message content.
    pub content: String,
}

/// Parameters for one [`LLMProvider::call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmRequest {
    /// The calling stage's role label (e.g. `"feasibility"`).
    pub role: String,
    /// The prompt template version in use.
    pub prompt_version: String,
    /// The conversation so far.
    pub messages: Vec<LlmMessage>,
    /// The maximum tokens the provider may return.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

/// Token usage reported by a single [`LLMProvider::call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LlmUsage {
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Completion tokens produced.
    pub output_tokens: u64,
}

/// The raw response of one [`LLMProvider::call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmResponse {
    /// The unparsed response content.
    pub raw_content: String,
    /// Reported token usage.
    pub usage: LlmUsage,
}

/// Errors an [`LLMProvider`] implementation may return.
///
/// # Invariants
/// - `Transient` is the only variant the worker framework retries.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// A transient failure (network error, rate limit, timeout).
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// The provider rejected the request outright (bad credentials, bad
    /// request shape).
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

/// The capability a stage worker uses to call an LLM.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Calls the LLM with `request`, returning its raw response.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Transient`] for retryable failures and
    /// [`ProviderError::Rejected`] for failures that should not be retried.
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError>;

    /// Estimates the token count of `text` without making a network call.
    fn estimate_tokens(&self, text: &str) -> u32;
}

// ============================================================================
// SECTION: CodeHostClient
// ============================================================================

/// A single entry in a repository tree listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// The entry's repository-relative path.
    pub path: String,
    /// `true` if the entry is a directory.
    pub is_directory: bool,
}

/// A branch reference on the code host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRef {
    /// The branch name.
    pub name: String,
    /// The commit SHA the branch points at.
    pub sha: String,
}

/// The result of opening a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedPullRequest {
    /// The pull request number.
    pub number: u64,
    /// The pull request URL.
    pub url: String,
}

/// Errors a [`CodeHostClient`] implementation may return.
#[derive(Debug, Error)]
pub enum CodeHostError {
    /// A transient failure (5xx, network error, timeout).
    #[error("transient code host failure: {0}")]
    Transient(String),
    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The Write Gate refused this write because no approval was recorded.
    #[error("write blocked: no recorded approval")]
    WriteBlockedNoApproval,
}

/// The capability a stage worker uses to read from and write to a remote
/// code host. Write methods are normally reached only through the Write
/// Gate, never called on this trait directly by a worker.
#[async_trait]
pub trait CodeHostClient: Send + Sync {
    /// Lists the tree at `sha`, recursively if `recursive` is set.
    ///
    /// # Errors
    ///
    /// Returns [`CodeHostError`] on any host failure.
    async fn get_tree(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        recursive: bool,
    ) -> Result<Vec<TreeEntry>, CodeHostError>;

    /// Reads the contents of `path` at `reference`.
    ///
    /// # Errors
    ///
    /// Returns [`CodeHostError`] on any host failure.
    async fn get_file_contents(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<Vec<u8>, CodeHostError>;

    /// Reads the current tip of `branch`.
    ///
    /// # Errors
    ///
    /// Returns [`CodeHostError`] on any host failure.
    async fn get_branch(&self, owner: &str, repo: &str, branch: &str) -> Result<BranchRef, CodeHostError>;

    /// Lists recent workflow runs for the repository.
    ///
    /// # Errors
    ///
    /// Returns [`CodeHostError`] on any host failure.
    async fn list_workflow_runs(&self, owner: &str, repo: &str) -> Result<Vec<String>, CodeHostError>;

    /// Lists the jobs of a single workflow run.
    ///
    /// # Errors
    ///
    /// Returns [`CodeHostError`] on any host failure.
    async fn get_workflow_run_jobs(&self, owner: &str, repo: &str, run_id: &str) -> Result<Vec<String>, CodeHostError>;

    /// Creates `branch` at `from_sha`. Idempotent: creating a branch that
    /// already points at `from_sha` succeeds without error.
    ///
    /// # Errors
    ///
    /// Returns [`CodeHostError`] on any host failure.
    async fn create_branch(
        &self,
        workflow_id: &WorkflowId,
        owner: &str,
        repo: &str,
        branch: &str,
        from_sha: &str,
    ) -> Result<BranchRef, CodeHostError>;

    /// Writes `contents` to `path` on `branch`. Idempotent with respect to
    /// repeated calls with identical inputs.
    ///
    /// # Errors
    ///
    /// Returns [`CodeHostError`] on any host failure.
    async fn update_file(
        &self,
        workflow_id: &WorkflowId,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<(), CodeHostError>;

    /// Opens a pull request from `head` into `base`. Idempotent: if a pull
    /// request already exists for `head`, returns it instead of opening a
    /// duplicate.
    ///
    /// # Errors
    ///
    /// Returns [`CodeHostError`] on any host failure.
    async fn open_pull_request(
        &self,
        workflow_id: &WorkflowId,
        owner: &str,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<OpenedPullRequest, CodeHostError>;

    /// Dispatches a repository workflow (e.g. a CI re-run).
    ///
    /// # Errors
    ///
    /// Returns [`CodeHostError`] on any host failure.
    async fn dispatch_workflow(
        &self,
        workflow_id: &WorkflowId,
        owner: &str,
        repo: &str,
        workflow_file: &str,
        reference: &str,
    ) -> Result<(), CodeHostError>;
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// Errors a [`Store`] implementation may return.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A transient I/O failure (connection loss, lock timeout).
    #[error("transient store failure: {0}")]
    Transient(String),
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Stored data failed an integrity check (hash mismatch, bad schema).
    #[error("corrupt data: {0}")]
    Corrupt(String),
    /// The caller asked for something the store's invariants forbid.
    #[error("invalid operation: {0}")]
    Invalid(String),
}

/// The persistence capability: parametric repository operations over every
/// entity in the data model, plus per-workflow locking.
#[async_trait]
pub trait Store: Send + Sync {
    /// Loads a workflow by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such workflow exists.
    async fn load_workflow(&self, id: &WorkflowId) -> Result<Workflow, StoreError>;

    /// Inserts a new workflow.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any store failure.
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Overwrites a workflow's mutable fields (`state`, `stage`,
    /// `stage_status`, `feedback`, `updated_at`, `base_sha`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any store failure.
    async fn update_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Inserts a new immutable artifact row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any store failure.
    async fn insert_artifact(&self, artifact: &Artifact) -> Result<(), StoreError>;

    /// Loads the latest artifact of `kind` for `workflow_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any store failure.
    async fn latest_artifact(
        &self,
        workflow_id: &WorkflowId,
        kind: ArtifactKind,
    ) -> Result<Option<Artifact>, StoreError>;

    /// Loads an artifact by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such artifact exists.
    async fn load_artifact(&self, id: &ArtifactId) -> Result<Artifact, StoreError>;

    /// Inserts a new PatchSet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any store failure.
    async fn insert_patch_set(&self, patch_set: &PatchSet) -> Result<(), StoreError>;

    /// Updates a PatchSet's status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any store failure.
    async fn update_patch_set(&self, patch_set: &PatchSet) -> Result<(), StoreError>;

    /// Loads the latest PatchSet for `workflow_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any store failure.
    async fn latest_patch_set(&self, workflow_id: &WorkflowId) -> Result<Option<PatchSet>, StoreError>;

    /// Loads a PatchSet by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such PatchSet exists.
    async fn load_patch_set(&self, id: &PatchSetId) -> Result<PatchSet, StoreError>;

    /// Inserts a recorded approval.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any store failure.
    async fn insert_approval(&self, approval: &Approval) -> Result<(), StoreError>;

    /// Lists approvals recorded for `workflow_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any store failure.
    async fn list_approvals(&self, workflow_id: &WorkflowId) -> Result<Vec<Approval>, StoreError>;

    /// Atomically replaces all policy violations for `patch_set_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any store failure.
    async fn replace_violations(
        &self,
        patch_set_id: &PatchSetId,
        violations: &[PolicyViolation],
    ) -> Result<(), StoreError>;

    /// Lists the current policy violations for `patch_set_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any store failure.
    async fn list_violations(&self, patch_set_id: &PatchSetId) -> Result<Vec<PolicyViolation>, StoreError>;

    /// Appends a workflow event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any store failure.
    async fn append_event(&self, event: &WorkflowEvent) -> Result<(), StoreError>;

    /// Lists events recorded for `workflow_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any store failure.
    async fn list_events(&self, workflow_id: &WorkflowId) -> Result<Vec<WorkflowEvent>, StoreError>;

    /// Starts a new run record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any store failure.
    async fn start_run(&self, run: &WorkflowRun) -> Result<(), StoreError>;

    /// Overwrites a run record (used to record completion or failure).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any store failure.
    async fn update_run(&self, run: &WorkflowRun) -> Result<(), StoreError>;

    /// Finds completed runs whose `input_hash` equals `input_hash`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any store failure.
    async fn find_runs_by_input_hash(&self, input_hash: &str) -> Result<Vec<WorkflowRun>, StoreError>;

    /// Acquires the exclusive per-workflow lock, runs `f`, and releases it.
    /// Implementations must serialize all holders of the same `workflow_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the lock cannot be acquired.
    async fn with_workflow_lock<'a>(
        &'a self,
        workflow_id: &'a WorkflowId,
        f: Box<dyn FnOnce() -> Result<(), StoreError> + Send + 'a>,
    ) -> Result<(), StoreError>;
}

/// Re-exports the ids returned by newly-inserted rows, for convenience at
/// call sites that only need the identifier back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertedIds {
    /// An approval id, when relevant.
    pub approval_id: Option<ApprovalId>,
    /// An event id, when relevant.
    pub event_id: Option<EventId>,
    /// A run id, when relevant.
    pub run_id: Option<RunId>,
    /// A violation id, when relevant.
    pub violation_id: Option<ViolationId>,
}

// ============================================================================
// SECTION: Queues
// ============================================================================

/// Errors a [`Queues`] implementation may return.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The named queue has not been registered.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    /// A transient failure (broker unavailable, timeout).
    #[error("transient queue failure: {0}")]
    Transient(String),
}

/// Options accompanying an [`Queues::enqueue`] call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnqueueOptions {
    /// A deduplication key; redelivery with the same key is a no-op for
    /// at-least-once brokers that support it.
    pub idempotency_key: Option<String>,
}

/// The capability to publish a job payload onto a named queue.
#[async_trait]
pub trait Queues: Send + Sync {
    /// Publishes `payload` onto `queue`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownQueue`] if `queue` is not registered and
    /// [`QueueError::Transient`] for retryable broker failures.
    async fn enqueue(&self, queue: &str, payload: Value, options: EnqueueOptions) -> Result<(), QueueError>;
}

// crates/changegate-worker/src/stages/write_gate.rs
// ============================================================================
// Module: Write Gate (Gate1 enforcement)
// Description: Wraps a CodeHostClient so every write method first asserts
//              an apply_patches approval exists for the workflow.
// Purpose: The only enforcement point for "no external write without
//          approval"; read methods pass through unguarded.
// Dependencies: changegate-core, async-trait
// ============================================================================

//! ## Overview
//! [`WriteGate`] delegates every read method straight to the wrapped
//! [`CodeHostClient`] and checks, before every write method, that
//! [`Store::list_approvals`] contains at least one [`ApprovalKind::ApplyPatches`]
//! row for the workflow. If not, the write fails with
//! [`CodeHostError::WriteBlockedNoApproval`], which the job-worker failure
//! path turns into `E_JOB_FAILED{error: "WRITE_BLOCKED_NO_APPROVAL"}` and the
//! transition function routes to `BlockedPolicy`, not `Failed`.

use std::sync::Arc;

use async_trait::async_trait;
use changegate_core::identifiers::WorkflowId;
use changegate_core::interfaces::BranchRef;
use changegate_core::interfaces::CodeHostClient;
use changegate_core::interfaces::CodeHostError;
use changegate_core::interfaces::OpenedPullRequest;
use changegate_core::interfaces::Store;
use changegate_core::interfaces::TreeEntry;
use changegate_core::model::ApprovalKind;

/// Wraps `inner` so every write method is gated on a recorded approval.
pub struct WriteGate {
    /// The wrapped client.
    inner: Arc<dyn CodeHostClient>,
    /// The store consulted for the approval check.
    store: Arc<dyn Store>,
}

impl WriteGate {
    /// Creates a gate wrapping `inner`, checking approvals via `store`.
    #[must_use]
    pub fn new(inner: Arc<dyn CodeHostClient>, store: Arc<dyn Store>) -> Self {
        Self { inner, store }
    }

    /// Asserts an `apply_patches` approval exists for `workflow_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CodeHostError::WriteBlockedNoApproval`] if none is found, or
    /// [`CodeHostError::Transient`] if the store lookup itself fails.
    async fn assert_approved(&self, workflow_id: &WorkflowId) -> Result<(), CodeHostError> {
        let approvals = self.store.list_approvals(workflow_id).await.map_err(|err| CodeHostError::Transient(err.to_string()))?;
        if approvals.iter().any(|approval| approval.kind == ApprovalKind::ApplyPatches) {
            Ok(())
        } else {
            Err(CodeHostError::WriteBlockedNoApproval)
        }
    }
}

#[async_trait]
impl CodeHostClient for WriteGate {
    async fn get_tree(&self, owner: &str, repo: &str, sha: &str, recursive: bool) -> Result<Vec<TreeEntry>, CodeHostError> {
        self.inner.get_tree(owner, repo, sha, recursive).await
    }

    async fn get_file_contents(&self, owner: &str, repo: &str, path: &str, reference: &str) -> Result<Vec<u8>, CodeHostError> {
        self.inner.get_file_contents(owner, repo, path, reference).await
    }

    async fn get_branch(&self, owner: &str, repo: &str, branch: &str) -> Result<BranchRef, CodeHostError> {
        self.inner.get_branch(owner, repo, branch).await
    }

    async fn list_workflow_runs(&self, owner: &str, repo: &str) -> Result<Vec<String>, CodeHostError> {
        self.inner.list_workflow_runs(owner, repo).await
    }

    async fn get_workflow_run_jobs(&self, owner: &str, repo: &str, run_id: &str) -> Result<Vec<String>, CodeHostError> {
        self.inner.get_workflow_run_jobs(owner, repo, run_id).await
    }

    async fn create_branch(&self, workflow_id: &WorkflowId, owner: &str, repo: &str, branch: &str, from_sha: &str) -> Result<BranchRef, CodeHostError> {
        self.assert_approved(workflow_id).await?;
        self.inner.create_branch(workflow_id, owner, repo, branch, from_sha).await
    }

    async fn update_file(&self, workflow_id: &WorkflowId, owner: &str, repo: &str, branch: &str, path: &str, contents: &[u8]) -> Result<(), CodeHostError> {
        self.assert_approved(workflow_id).await?;
        self.inner.update_file(workflow_id, owner, repo, branch, path, contents).await
    }

    async fn open_pull_request(
        &self,
        workflow_id: &WorkflowId,
        owner: &str,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<OpenedPullRequest, CodeHostError> {
        self.assert_approved(workflow_id).await?;
        self.inner.open_pull_request(workflow_id, owner, repo, head, base, title, body).await
    }

    async fn dispatch_workflow(&self, workflow_id: &WorkflowId, owner: &str, repo: &str, workflow_file: &str, reference: &str) -> Result<(), CodeHostError> {
        self.assert_approved(workflow_id).await?;
        self.inner.dispatch_workflow(workflow_id, owner, repo, workflow_file, reference).await
    }
}

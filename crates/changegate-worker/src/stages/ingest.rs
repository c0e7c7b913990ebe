// crates/changegate-worker/src/stages/ingest.rs
// ============================================================================
// Module: Ingest Job
// Description: The automatic, non-gated job that pulls a feature request's
//              primary repository tree into repo-context for later stages.
// Purpose: Give feasibility and later stages a repo-context summary without
//          a human gate, per the ingested -> patches_proposed transition.
// Dependencies: changegate-core, async-trait
// ============================================================================

//! ## Overview
//! [`IngestWorker`] reads the primary repo's tree at its base branch through
//! [`changegate_core::interfaces::CodeHostClient`]'s read methods (never the
//! Write Gate; nothing here writes) and returns a bounded file-path summary
//! as the job result, recorded on the `worker.ingest_context.completed`
//! event for later stages to read back via [`changegate_core::interfaces::Store::list_events`].

use async_trait::async_trait;
use changegate_core::interfaces::CodeHostClient;
use serde_json::Value;
use serde_json::json;

use crate::stage_worker::JobWorker;
use crate::stage_worker::StageInputs;

/// Caps the number of tree paths carried into the ingest summary, so a huge
/// monorepo tree never blows up the event payload.
const MAX_SUMMARIZED_PATHS: usize = 500;

/// Gathers repo context for the workflow's primary repository.
pub struct IngestWorker {
    /// The code host client used for read-only tree/file access.
    code_host: std::sync::Arc<dyn CodeHostClient>,
}

impl IngestWorker {
    /// Creates an ingest worker bound to `code_host`.
    #[must_use]
    pub fn new(code_host: std::sync::Arc<dyn CodeHostClient>) -> Self {
        Self { code_host }
    }
}

#[async_trait]
impl JobWorker for IngestWorker {
    fn job_name(&self) -> &str {
        "ingest_context"
    }

    async fn run(&self, inputs: &StageInputs) -> Result<Value, String> {
        let repo = inputs.workflow.repos.first().ok_or_else(|| "workflow has no target repository".to_owned())?;
        let branch = self
            .code_host
            .get_branch(&repo.owner, &repo.name, &repo.base_branch)
            .await
            .map_err(|err| format!("failed to read base branch: {err}"))?;
        let tree = self
            .code_host
            .get_tree(&repo.owner, &repo.name, &branch.sha, true)
            .await
            .map_err(|err| format!("failed to read repo tree: {err}"))?;

        let total_entries = tree.len();
        let paths: Vec<&str> = tree.iter().filter(|entry| !entry.is_directory).map(|entry| entry.path.as_str()).take(MAX_SUMMARIZED_PATHS).collect();
        let truncated = total_entries > paths.len();

        Ok(json!({
            "baseSha": branch.sha,
            "totalEntries": total_entries,
            "paths": paths,
            "truncated": truncated,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use changegate_core::interfaces::BranchRef;
    use changegate_core::interfaces::CodeHostError;
    use changegate_core::interfaces::OpenedPullRequest;
    use changegate_core::interfaces::TreeEntry;
    use changegate_core::model::Repo;
    use changegate_core::model::StageStatus;
    use changegate_core::model::Workflow;
    use changegate_core::model::WorkflowState;
    use changegate_core::time::Timestamp;

    use super::*;

    struct FakeCodeHost {
        entries: Vec<TreeEntry>,
    }

    #[async_trait]
    impl CodeHostClient for FakeCodeHost {
        async fn get_tree(&self, _owner: &str, _repo: &str, _sha: &str, _recursive: bool) -> Result<Vec<TreeEntry>, CodeHostError> {
            Ok(self.entries.clone())
        }

        async fn get_file_contents(&self, _owner: &str, _repo: &str, _path: &str, _reference: &str) -> Result<Vec<u8>, CodeHostError> {
            Err(CodeHostError::NotFound("unused in this test".to_owned()))
        }

        async fn get_branch(&self, _owner: &str, _repo: &str, branch: &str) -> Result<BranchRef, CodeHostError> {
            Ok(BranchRef { name: branch.to_owned(), sha: "deadbeef".to_owned() })
        }

        async fn list_workflow_runs(&self, _owner: &str, _repo: &str) -> Result<Vec<String>, CodeHostError> {
            Ok(Vec::new())
        }

        async fn get_workflow_run_jobs(&self, _owner: &str, _repo: &str, _run_id: &str) -> Result<Vec<String>, CodeHostError> {
            Ok(Vec::new())
        }

        async fn create_branch(
            &self,
            _workflow_id: &changegate_core::identifiers::WorkflowId,
            _owner: &str,
            _repo: &str,
            branch: &str,
            from_sha: &str,
        ) -> Result<BranchRef, CodeHostError> {
            Ok(BranchRef { name: branch.to_owned(), sha: from_sha.to_owned() })
        }

        async fn update_file(
            &self,
            _workflow_id: &changegate_core::identifiers::WorkflowId,
            _owner: &str,
            _repo: &str,
            _branch: &str,
            _path: &str,
            _contents: &[u8],
        ) -> Result<(), CodeHostError> {
            Ok(())
        }

        async fn open_pull_request(
            &self,
            _workflow_id: &changegate_core::identifiers::WorkflowId,
            _owner: &str,
            _repo: &str,
            _head: &str,
            _base: &str,
            _title: &str,
            _body: &str,
        ) -> Result<OpenedPullRequest, CodeHostError> {
            Ok(OpenedPullRequest { number: 1, url: "https://example.invalid/pr/1".to_owned() })
        }

        async fn dispatch_workflow(
            &self,
            _workflow_id: &changegate_core::identifiers::WorkflowId,
            _owner: &str,
            _repo: &str,
            _workflow_file: &str,
            _reference: &str,
        ) -> Result<(), CodeHostError> {
            Ok(())
        }
    }

    fn workflow(now: Timestamp) -> Workflow {
        Workflow {
            id: changegate_core::identifiers::WorkflowId::new("wf-1"),
            state: WorkflowState::Ingested,
            stage: changegate_core::identifiers::StageName::Ingest,
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
    async fn summarizes_the_tree_and_caps_paths() {
        let now = Timestamp::from_unix_millis(1_000);
        let entries = (0..MAX_SUMMARIZED_PATHS + 10)
            .map(|index| TreeEntry { path: format!("src/file_{index}.rs"), is_directory: false })
            .collect();
        let worker = IngestWorker::new(Arc::new(FakeCodeHost { entries }));
        let inputs = StageInputs { workflow: workflow(now), prior_artifacts: Vec::new(), payload: json!({}) };
        let result = worker.run(&inputs).await.expect("succeeds");
        assert_eq!(result["baseSha"], "deadbeef");
        assert_eq!(result["truncated"], true);
        assert_eq!(result["paths"].as_array().expect("array").len(), MAX_SUMMARIZED_PATHS);
    }

    #[tokio::test]
    async fn missing_repo_is_reported() {
        let now = Timestamp::from_unix_millis(1_000);
        let mut wf = workflow(now);
        wf.repos.clear();
        let worker = IngestWorker::new(Arc::new(FakeCodeHost { entries: Vec::new() }));
        let inputs = StageInputs { workflow: wf, prior_artifacts: Vec::new(), payload: json!({}) };
        assert!(worker.run(&inputs).await.is_err());
    }
}

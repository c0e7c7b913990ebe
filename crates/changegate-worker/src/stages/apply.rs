// crates/changegate-worker/src/stages/apply.rs
// ============================================================================
// Module: Apply Patches Job
// Description: The automatic job that applies an approved PatchSet to the
//              code host through the Write Gate and opens the pull request.
// Purpose: Implement the `applying_patches -> pr_open` transition's only
//          side-effecting step.
// Dependencies: changegate-core, async-trait
// ============================================================================

//! ## Overview
//! [`ApplyPatchesWorker`] loads the approved [`PatchSet`] named in the job
//! payload, creates a branch derived from `(workflowId, patchSetId)` for
//! idempotent re-delivery, applies each patch's unified diff file-by-file
//! through the [`crate::stages::write_gate::WriteGate`]-wrapped
//! [`CodeHostClient`], and opens the pull request. A
//! [`CodeHostError::WriteBlockedNoApproval`] is surfaced verbatim as the
//! literal string `"WRITE_BLOCKED_NO_APPROVAL"`, the exact error text the
//! transition function matches to route to `BlockedPolicy` rather than
//! `Failed`.
//!
//! The `CodeHostClient` surface exposes no delete operation; a `Delete`
//! file action is recorded in the result payload under `skippedDeletes`
//! rather than attempted.

use std::sync::Arc;

use async_trait::async_trait;
use changegate_core::identifiers::PatchSetId;
use changegate_core::identifiers::WorkflowId;
use changegate_core::interfaces::CodeHostClient;
use changegate_core::interfaces::CodeHostError;
use changegate_core::interfaces::Store;
use changegate_core::model::FileAction;
use changegate_core::model::Patch;
use changegate_core::transition::WRITE_BLOCKED_NO_APPROVAL;
use serde_json::Value;
use serde_json::json;

use crate::stage_worker::JobWorker;
use crate::stage_worker::StageInputs;

/// Applies an approved PatchSet to the code host and opens its pull request.
pub struct ApplyPatchesWorker {
    /// The store, for loading the approved PatchSet.
    store: Arc<dyn Store>,
    /// The Write-Gate-wrapped code host client.
    code_host: Arc<dyn CodeHostClient>,
}

impl ApplyPatchesWorker {
    /// Creates a worker bound to `store` and `code_host`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, code_host: Arc<dyn CodeHostClient>) -> Self {
        Self { store, code_host }
    }
}

#[async_trait]
impl JobWorker for ApplyPatchesWorker {
    fn job_name(&self) -> &str {
        "apply_patches"
    }

    async fn run(&self, inputs: &StageInputs) -> Result<Value, String> {
        let patch_set_id = inputs
            .payload
            .get("patchSetId")
            .and_then(Value::as_str)
            .map(PatchSetId::new)
            .ok_or_else(|| "apply_patches payload missing patchSetId".to_owned())?;
        let patch_set = self.store.load_patch_set(&patch_set_id).await.map_err(|err| err.to_string())?;
        let repo = inputs.workflow.repos.first().ok_or_else(|| "workflow has no target repository".to_owned())?;
        let workflow_id = &inputs.workflow.id;

        let branch_name = format!("changegate/{}-{}", workflow_id.as_str(), patch_set_id.as_str());
        let branch = self
            .code_host
            .create_branch(workflow_id, &repo.owner, &repo.name, &branch_name, &patch_set.base_sha)
            .await
            .map_err(|err| map_code_host_error(&err))?;

        let mut skipped_deletes = Vec::new();
        for patch in &patch_set.patches {
            self.apply_patch(workflow_id, &repo.owner, &repo.name, &branch_name, &branch.sha, patch, &mut skipped_deletes).await?;
        }

        let title = format!("[changegate] {}", patch_set.title);
        let body = format!("Automated change for workflow `{}`.", workflow_id.as_str());
        let opened = self
            .code_host
            .open_pull_request(workflow_id, &repo.owner, &repo.name, &branch_name, &repo.base_branch, &title, &body)
            .await
            .map_err(|err| map_code_host_error(&err))?;

        Ok(json!({
            "prNumber": opened.number,
            "prUrl": opened.url,
            "branch": branch_name,
            "skippedDeletes": skipped_deletes,
        }))
    }
}

impl ApplyPatchesWorker {
    /// Applies one patch's file changes to `branch`, skipping deletes (the
    /// code host surface has no delete operation) and recording them in
    /// `skipped_deletes`.
    async fn apply_patch(
        &self,
        workflow_id: &WorkflowId,
        owner: &str,
        repo: &str,
        branch_name: &str,
        base_sha: &str,
        patch: &Patch,
        skipped_deletes: &mut Vec<String>,
    ) -> Result<(), String> {
        let file_diffs = parse_patch_files(&patch.diff);
        for file_change in &patch.files {
            match file_change.action {
                FileAction::Delete => {
                    skipped_deletes.push(file_change.path.clone());
                    continue;
                }
                FileAction::Create | FileAction::Modify => {}
            }

            let Some(file_diff) = file_diffs.iter().find(|file_diff| file_diff.path == file_change.path) else {
                continue;
            };

            let original = if file_change.action == FileAction::Create {
                String::new()
            } else {
                let bytes = self
                    .code_host
                    .get_file_contents(owner, repo, &file_change.path, base_sha)
                    .await
                    .map_err(|err| map_code_host_error(&err))?;
                String::from_utf8(bytes).map_err(|err| format!("{} is not valid utf-8: {err}", file_change.path))?
            };

            let new_contents = apply_hunks(&original, &file_diff.hunks).map_err(|err| format!("{}: {err}", file_change.path))?;
            self.code_host
                .update_file(workflow_id, owner, repo, branch_name, &file_change.path, new_contents.as_bytes())
                .await
                .map_err(|err| map_code_host_error(&err))?;
        }
        Ok(())
    }
}

/// Maps a [`CodeHostError`] to the job's error message, preserving the
/// transition function's literal `WRITE_BLOCKED_NO_APPROVAL` match.
fn map_code_host_error(error: &CodeHostError) -> String {
    match error {
        CodeHostError::WriteBlockedNoApproval => WRITE_BLOCKED_NO_APPROVAL.to_owned(),
        other => other.to_string(),
    }
}

// ============================================================================
// SECTION: Minimal unified diff applier
// ============================================================================

/// One file's hunks within a combined unified diff.
struct PatchFileDiff {
    /// The file's path after the change.
    path: String,
    /// The file's hunks, in order.
    hunks: Vec<Hunk>,
}

/// A single `@@ -old_start,old_len +new_start,new_len @@` hunk.
struct Hunk {
    /// 1-based starting line in the original file; 0 for a brand-new file.
    old_start: usize,
    /// The hunk's body lines.
    lines: Vec<DiffLine>,
}

/// One line within a hunk body.
enum DiffLine {
    /// An unchanged line, present in both old and new content.
    Context(String),
    /// A line added in the new content.
    Add(String),
    /// A line removed from the old content.
    Remove(String),
}

/// Parses a combined unified diff into per-file hunks with full line
/// content, for patch application (distinct from
/// [`changegate_policy::diff::parse_diff`], which only counts lines for
/// policy scanning).
fn parse_patch_files(diff: &str) -> Vec<PatchFileDiff> {
    let mut files = Vec::new();
    let mut current_path: Option<String> = None;
    let mut current_hunks: Vec<Hunk> = Vec::new();

    for line in diff.lines() {
        if let Some(new_path) = line.strip_prefix("diff --git ").and_then(|rest| rest.find(" b/").map(|index| rest[index + 3..].to_owned())) {
            flush_file(&mut current_path, &mut current_hunks, &mut files);
            current_path = Some(new_path);
        } else if line.starts_with("@@ ") || line == "@@" {
            if let Some(old_start) = parse_hunk_old_start(line) {
                current_hunks.push(Hunk { old_start, lines: Vec::new() });
            }
        } else if let Some(hunk) = current_hunks.last_mut() {
            if let Some(content) = line.strip_prefix('+') {
                if !line.starts_with("+++") {
                    hunk.lines.push(DiffLine::Add(content.to_owned()));
                }
            } else if let Some(content) = line.strip_prefix('-') {
                if !line.starts_with("---") {
                    hunk.lines.push(DiffLine::Remove(content.to_owned()));
                }
            } else if let Some(content) = line.strip_prefix(' ') {
                hunk.lines.push(DiffLine::Context(content.to_owned()));
            }
        }
    }
    flush_file(&mut current_path, &mut current_hunks, &mut files);
    files
}

/// Appends the in-progress file's accumulated hunks to `files`, if a path
/// was ever established.
fn flush_file(current_path: &mut Option<String>, current_hunks: &mut Vec<Hunk>, files: &mut Vec<PatchFileDiff>) {
    if let Some(path) = current_path.take() {
        files.push(PatchFileDiff { path, hunks: std::mem::take(current_hunks) });
    }
}

/// Parses the old-file starting line from a `@@ -a,b +c,d @@` header.
fn parse_hunk_old_start(header: &str) -> Option<usize> {
    let after_at = header.strip_prefix("@@ ")?;
    let minus_field = after_at.strip_prefix('-')?;
    let end = minus_field.find(|c: char| c == ',' || c == ' ')?;
    let start: usize = minus_field[..end].parse().ok()?;
    Some(start)
}

/// Applies `hunks` to `original`, returning the resulting content.
///
/// # Errors
///
/// Returns an error if a hunk's recorded starting line falls outside the
/// original content.
fn apply_hunks(original: &str, hunks: &[Hunk]) -> Result<String, String> {
    let original_lines: Vec<&str> = original.lines().collect();
    let mut output: Vec<String> = Vec::new();
    let mut cursor = 0usize;

    for hunk in hunks {
        let hunk_start = hunk.old_start.saturating_sub(1);
        if hunk_start > original_lines.len() {
            return Err(format!("hunk starts at line {} past end of file ({} lines)", hunk.old_start, original_lines.len()));
        }
        for line in &original_lines[cursor..hunk_start] {
            output.push((*line).to_owned());
        }
        cursor = hunk_start;

        for diff_line in &hunk.lines {
            match diff_line {
                DiffLine::Context(content) => {
                    if cursor >= original_lines.len() {
                        return Err(format!("context line past end of file at original line {}", cursor + 1));
                    }
                    output.push(content.clone());
                    cursor += 1;
                }
                DiffLine::Remove(_) => {
                    if cursor >= original_lines.len() {
                        return Err(format!("removed line past end of file at original line {}", cursor + 1));
                    }
                    cursor += 1;
                }
                DiffLine::Add(content) => {
                    output.push(content.clone());
                }
            }
        }
    }
    for line in &original_lines[cursor.min(original_lines.len())..] {
        output.push((*line).to_owned());
    }

    let mut result = output.join("\n");
    if !original.is_empty() && original.ends_with('\n') {
        result.push('\n');
    }
    Ok(result)
}

// crates/changegate-worker/src/specialist/merge.rs
// ============================================================================
// Module: Proposal Merge
// Description: Combines per-agent proposals into a single PatchSet, after
//              conflict detection and resolution.
// Purpose: Produce one mergeable PatchSet whose title, patch list, and diff
//          reflect every contributing agent, ready for Gate2 evaluation.
// Dependencies: changegate-core
// ============================================================================

//! ## Overview
//! [`merge_proposals`] concatenates contributing titles, drops patches for
//! files a [`crate::specialist::conflict::PatchConflict`] resolved away
//! from an agent, deduplicates by task id (first occurrence wins), and
//! concatenates the unified diffs of the surviving patches. The caller is
//! responsible for running the merged diff through Gate2 before persisting
//! the returned [`PatchSet`]; a FAIL verdict means the caller should record
//! `PROPOSAL_REJECTED` instead of calling [`Store::insert_patch_set`] with
//! it.
//!
//! [`Store::insert_patch_set`]: changegate_core::interfaces::Store::insert_patch_set

use std::collections::HashSet;

use changegate_core::identifiers::ArtifactId;
use changegate_core::identifiers::PatchSetId;
use changegate_core::identifiers::WorkflowId;
use changegate_core::model::Patch;
use changegate_core::model::PatchSet;
use changegate_core::model::PatchSetStatus;

use crate::specialist::conflict::PatchConflict;
use crate::specialist::conflict::files_to_drop;
use crate::specialist::strategy::Proposal;

/// A merged proposal, ready for the caller to run through Gate2 before
/// persisting `patch_set`.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The merged, not-yet-persisted PatchSet.
    pub patch_set: PatchSet,
    /// The concatenated unified diff of every surviving patch, the input
    /// Gate2 evaluates.
    pub merged_diff: String,
}

/// Merges `proposals` into a single proposed [`PatchSet`], applying
/// `conflicts`' resolutions and deduplicating by task id.
#[must_use]
pub fn merge_proposals(
    id: PatchSetId,
    workflow_id: WorkflowId,
    artifact_id: ArtifactId,
    base_sha: String,
    proposals: &[Proposal],
    conflicts: &[PatchConflict],
) -> MergeOutcome {
    let drops: HashSet<(String, String)> = files_to_drop(conflicts).into_iter().map(|(agent, file)| (agent.as_str().to_owned(), file)).collect();

    let mut seen_task_ids = HashSet::new();
    let mut merged_patches: Vec<Patch> = Vec::new();
    let mut titles = Vec::new();

    for proposal in proposals {
        let agent_key = proposal.agent_id.as_str().to_owned();
        let mut contributed = false;
        for patch in &proposal.patches {
            let kept_files: Vec<_> = patch.files.iter().filter(|file| !drops.contains(&(agent_key.clone(), file.path.clone()))).cloned().collect();
            if kept_files.is_empty() {
                continue;
            }
            if let Some(task_id) = &patch.task_id
                && !seen_task_ids.insert(task_id.clone())
            {
                continue;
            }
            let mut kept_patch = patch.clone();
            kept_patch.files = kept_files;
            merged_patches.push(kept_patch);
            contributed = true;
        }
        if contributed {
            titles.push(proposal_title(proposal));
        }
    }

    let title = titles.join("; ");
    let merged_diff = merged_patches.iter().map(|patch| patch.diff.as_str()).collect::<Vec<_>>().join("\n");
    let patch_set = PatchSet { id, workflow_id, artifact_id, title, base_sha, status: PatchSetStatus::Proposed, patches: merged_patches };

    MergeOutcome { patch_set, merged_diff }
}

/// Builds the contributing title fragment for one proposal.
fn proposal_title(proposal: &Proposal) -> String {
    proposal
        .patches
        .first()
        .map(|patch| patch.title.clone())
        .unwrap_or_else(|| format!("{} proposal", proposal.agent_id.as_str()))
}

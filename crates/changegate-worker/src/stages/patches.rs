// crates/changegate-worker/src/stages/patches.rs
// ============================================================================
// Module: Patches Stage
// Description: Dispatches the specialist proposal service, merges the
//              results, and evaluates the merged diff against Gate2 before
//              persisting a PatchSet.
// Purpose: Turn the upstream architecture/timeline artifacts into a
//          Gate2-clean PatchSet ready for human review.
// Dependencies: changegate-core, changegate-policy, async-trait, serde_json
// ============================================================================

//! ## Overview
//! [`PatchesWorker`] is the one stage whose `process_artifact` dispatches a
//! whole sub-pipeline: [`specialist::run_dispatch`] collects one
//! [`specialist::Proposal`] per qualifying agent,
//! [`specialist::detect_conflicts`] finds files more than one agent touched,
//! and [`specialist::merge_proposals`] combines what survives into a single
//! candidate [`PatchSet`]. The candidate's merged diff is then run through
//! [`evaluate_gate2`] *before* anything is persisted: a `FAIL` verdict means
//! the stage fails with a `PROPOSAL_REJECTED` message rather than ever
//! calling [`Store::insert_patch_set`] — the same "merge is not the same as
//! accept" split [`crate::specialist::merge`] documents.

use std::sync::Arc;

use async_trait::async_trait;
use changegate_core::identifiers::ArtifactId;
use changegate_core::identifiers::PatchSetId;
use changegate_core::identifiers::StageName;
use changegate_core::identifiers::WorkflowId;
use changegate_core::interfaces::Store;
use changegate_core::model::ArtifactKind;
use changegate_core::time::Timestamp;
use changegate_policy::config::Gate2Config;
use changegate_policy::evaluate_gate2;
use changegate_policy::verdict::Verdict;
use serde_json::Value;
use serde_json::json;

use crate::specialist::ConflictResolution;
use crate::specialist::DispatchStrategy;
use crate::specialist::ProposalContext;
use crate::specialist::SpecialistRegistry;
use crate::specialist::Task;
use crate::specialist::detect_conflicts;
use crate::specialist::merge_proposals;
use crate::specialist::registry::AgentType;
use crate::specialist::run_dispatch;
use crate::stage_worker::StageInputs;
use crate::stage_worker::StageWorker;

/// Dispatches specialists, merges their proposals, and gates the result
/// through Gate2 before persisting a [`PatchSet`].
pub struct PatchesWorker {
    /// The store, for reading the registry's task context and persisting
    /// the resulting PatchSet.
    store: Arc<dyn Store>,
    /// The registered specialist agents.
    registry: Arc<SpecialistRegistry>,
    /// The coordination strategy used to dispatch the registry.
    strategy: DispatchStrategy,
    /// How file-level conflicts between agents are resolved during merge.
    conflict_resolution: ConflictResolution,
    /// The Gate2 configuration the merged diff is evaluated against.
    config: Gate2Config,
}

impl PatchesWorker {
    /// Creates a patches worker bound to `store` and `registry`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, registry: Arc<SpecialistRegistry>, strategy: DispatchStrategy, conflict_resolution: ConflictResolution, config: Gate2Config) -> Self {
        Self { store, registry, strategy, conflict_resolution, config }
    }

    /// Builds the task dispatched to every specialist from `inputs`.
    fn build_task(inputs: &StageInputs) -> Task {
        let target_files: Vec<String> = inputs
            .payload
            .get("targetFiles")
            .and_then(Value::as_array)
            .map(|files| files.iter().filter_map(Value::as_str).map(str::to_owned).collect())
            .unwrap_or_default();
        let task_type = inputs
            .payload
            .get("taskType")
            .and_then(Value::as_str)
            .map_or(AgentType::Backend, |raw| match raw {
                "frontend" => AgentType::Frontend,
                "test" => AgentType::Test,
                "review" => AgentType::Review,
                "docs" => AgentType::Docs,
                "refactor" => AgentType::Refactor,
                _ => AgentType::Backend,
            });
        Task { task_type, description: inputs.workflow.feature_goal.clone(), target_files }
    }

    /// Predicts the [`ArtifactId`] `run_stage_job`'s `persist_artifact` will
    /// assign to this stage's own artifact, so the PatchSet's
    /// `artifact_id` link is correct once that row exists.
    async fn predicted_artifact_id(&self, workflow_id: &WorkflowId) -> Result<ArtifactId, String> {
        let existing = self.store.latest_artifact(workflow_id, ArtifactKind::PatchSetV1).await.map_err(|err| err.to_string())?;
        let next_version = existing.map_or(1, |artifact| artifact.artifact_version + 1);
        Ok(ArtifactId::new(format!("{workflow_id}:{:?}:{next_version}", ArtifactKind::PatchSetV1)))
    }
}

#[async_trait]
impl StageWorker for PatchesWorker {
    fn stage(&self) -> StageName {
        StageName::Patches
    }

    fn artifact_kind(&self) -> ArtifactKind {
        ArtifactKind::PatchSetV1
    }

    async fn process_artifact(&self, inputs: &StageInputs) -> Result<Value, String> {
        let detected_language = inputs.payload.get("detectedLanguage").and_then(Value::as_str).map(str::to_owned);
        let ctx = ProposalContext { task: Self::build_task(inputs), detected_language, prior_patches: Vec::new() };

        let proposals = run_dispatch(&self.registry, &ctx, self.strategy).await;
        if proposals.is_empty() {
            return Err("no specialist agent produced a proposal for this task".to_owned());
        }

        let conflicts = detect_conflicts(&proposals, self.conflict_resolution);

        let workflow_id = inputs.workflow.id.clone();
        let base_sha = inputs.workflow.base_sha.clone().ok_or_else(|| "workflow has no base_sha to branch patches from".to_owned())?;
        let artifact_id = self.predicted_artifact_id(&workflow_id).await?;
        let patch_set_id = PatchSetId::new(format!("{workflow_id}:patchset:{}", inputs.workflow.updated_at.as_unix_millis()));

        let outcome = merge_proposals(patch_set_id, workflow_id.clone(), artifact_id, base_sha, &proposals, &conflicts);

        let risk_levels: Vec<_> = outcome.patch_set.patches.iter().map(|patch| patch.risk_level).collect();
        let now = Timestamp::from_unix_millis(inputs.workflow.updated_at.as_unix_millis());
        let gate2 = evaluate_gate2(&outcome.merged_diff, &self.config, &risk_levels, now);

        if gate2.verdict == Verdict::Fail {
            return Err(format!("PROPOSAL_REJECTED: {}", gate2.summary));
        }

        self.store.insert_patch_set(&outcome.patch_set).await.map_err(|err| err.to_string())?;

        Ok(json!({
            "patchSetId": outcome.patch_set.id.as_str(),
            "patchCount": outcome.patch_set.patches.len(),
            "contributingAgents": proposals.len(),
            "conflictCount": conflicts.len(),
            "gate2Verdict": gate2.verdict,
        }))
    }
}

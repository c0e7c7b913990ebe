// crates/changegate-worker/src/stages/sandbox.rs
// ============================================================================
// Module: Sandbox Stage (Placeholder)
// Description: The gated stage between policy and pr, with no worker
//              specification in the originating system.
// Purpose: Preserve the "nothing reaches pr without an explicit approval"
//          invariant without inventing sandboxing behavior.
// Dependencies: changegate-core
// ============================================================================

//! ## Overview
//! [`SandboxWorker`] makes no LLM call and runs no code. It produces a
//! minimal [`changegate_core::model::ArtifactKind::SandboxV1`] artifact
//! recording that the stage was passed through, so the stage still gates
//! behind an ordinary `E_STAGE_APPROVED{stage: "sandbox"}` before `pr` is
//! enqueued.

use async_trait::async_trait;
use changegate_core::identifiers::StageName;
use changegate_core::model::ArtifactKind;
use serde_json::Value;
use serde_json::json;

use crate::stage_worker::StageInputs;
use crate::stage_worker::StageWorker;

/// Passes the sandbox stage through without executing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct SandboxWorker;

#[async_trait]
impl StageWorker for SandboxWorker {
    fn stage(&self) -> StageName {
        StageName::Sandbox
    }

    fn artifact_kind(&self) -> ArtifactKind {
        ArtifactKind::SandboxV1
    }

    async fn process_artifact(&self, _inputs: &StageInputs) -> Result<Value, String> {
        Ok(json!({
            "passedThrough": true,
            "note": "no sandboxing behavior is implemented; this stage records pass-through only",
        }))
    }
}

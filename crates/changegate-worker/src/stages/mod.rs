// crates/changegate-worker/src/stages/mod.rs
// ============================================================================
// Module: Concrete Stage and Job Workers
// Description: One submodule per pipeline stage/job, each implementing
//              StageWorker or JobWorker against the shared framework.
// Purpose: Group the concrete, stage-specific logic away from the generic
//          bookkeeping in stage_worker.rs.
// Dependencies: changegate-core, changegate-policy, async-trait, serde_json
// ============================================================================

//! ## Overview
//! Every gated pipeline stage (feasibility, architecture, timeline, summary,
//! patches, policy, sandbox, pr) implements [`crate::stage_worker::StageWorker`]
//! here; the automatic jobs outside the gated pipeline (ingest_context,
//! evaluate_policy, apply_patches) implement [`crate::stage_worker::JobWorker`].

pub mod apply;
pub mod evaluate_policy;
pub mod ingest;
pub mod llm_stages;
pub mod patches;
pub mod policy_eval;
pub mod pr;
pub mod sandbox;
pub mod write_gate;

pub use apply::ApplyPatchesWorker;
pub use evaluate_policy::EvaluatePolicyWorker;
pub use ingest::IngestWorker;
pub use llm_stages::LlmStageWorker;
pub use patches::PatchesWorker;
pub use policy_eval::PolicyWorker;
pub use pr::PrWorker;
pub use sandbox::SandboxWorker;
pub use write_gate::WriteGate;

// crates/changegate-worker/src/lib.rs
// ============================================================================
// Module: Worker
// Description: The stage worker framework, its LLM artifact sub-protocol,
//              schema validation, run bookkeeping, cost ceilings, the
//              specialist registry, and the concrete per-stage workers.
// Purpose: Turn a dequeued job into a persisted, versioned artifact and a
//          queue message back to the orchestrator, for every stage.
// Dependencies: changegate-core, changegate-policy
// ============================================================================

//! ## Overview
//! A worker process dequeues jobs from its stage-specific queue and runs
//! each one through [`stage_worker::run_stage_job`], which is the same for
//! every stage; the only thing that differs per stage is the
//! [`stage_worker::StageWorker`] implementation, found under [`stages`].
//! LLM-backed stages build on [`llm_stage::run_llm_stage`] and
//! [`schema::SchemaRegistry`]; the patches stage additionally dispatches
//! through the [`specialist`] registry.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(missing_docs_in_private_items)]

pub mod cost_tracker;
pub mod llm_stage;
pub mod run_recorder;
pub mod schema;
pub mod specialist;
pub mod stage_worker;
pub mod stages;

pub use cost_tracker::CostCeilings;
pub use cost_tracker::CostTracker;
pub use llm_stage::run_llm_stage;
pub use run_recorder::RunRecorder;
pub use schema::SchemaRegistry;
pub use stage_worker::StageWorker;
pub use stage_worker::run_stage_job;

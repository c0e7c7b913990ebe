// crates/changegate-worker/src/specialist/mod.rs
// ============================================================================
// Module: Specialist Proposal Service
// Description: Re-exports the registry, dispatch strategies, conflict
//              detection, and merge routine backing the patches stage.
// Purpose: One coordination seam for "ask the specialist agents for
//          patches, merge what they produce".
// Dependencies: changegate-core
// ============================================================================

//! ## Overview
//! The patches stage dispatches a [`strategy::Task`] to the agents
//! registered in a [`registry::SpecialistRegistry`] under one of the four
//! [`strategy::DispatchStrategy`] variants, detects file-level
//! [`conflict::PatchConflict`]s across the resulting proposals, and
//! produces a single [`merge::MergeOutcome`] ready for Gate2 evaluation.

pub mod conflict;
pub mod llm_agent;
pub mod merge;
pub mod registry;
pub mod strategy;

pub use conflict::ConflictKind;
pub use conflict::ConflictResolution;
pub use conflict::PatchConflict;
pub use conflict::detect_conflicts;
pub use llm_agent::LlmSpecialistAgent;
pub use merge::MergeOutcome;
pub use merge::merge_proposals;
pub use registry::AgentCapabilities;
pub use registry::AgentType;
pub use registry::SpecialistAgent;
pub use registry::SpecialistRegistry;
pub use registry::SpecialistRegistryBuilder;
pub use strategy::DispatchStrategy;
pub use strategy::Proposal;
pub use strategy::ProposalContext;
pub use strategy::Task;
pub use strategy::run_dispatch;

// crates/changegate-orchestrator/src/lib.rs
// ============================================================================
// Module: Orchestrator Crate
// Description: The single writer of `Workflow::state`, the reconciliation
//              point between the gated stage pipeline and the coarse state
//              machine, and the consumer of the `"orchestrator"` queue.
// Purpose: Keep every workflow-state write behind one lock-holding,
//          transition-calling, event-appending, job-publishing choke point.
// Dependencies: changegate-broker, changegate-core, tokio, tokio-stream
// ============================================================================

//! ## Overview
//! This crate owns exactly the responsibilities `changegate_core` leaves to
//! its shell: deriving [`changegate_core::transition::TransitionContext`]
//! from the store ([`context`]), holding the per-workflow lock and calling
//! [`changegate_core::transition::transition`] ([`orchestrator`]), advancing
//! the gated stage pipeline on human approval/rejection and reconciling it
//! with the coarse state machine at the one point the two tracks meet
//! ([`stage_pipeline`]), and interpreting completed/failed job payloads off
//! the `"orchestrator"` queue ([`dispatch`]).
//!
//! `changegate_core::transition::transition` itself never changes; this
//! crate is the only caller that may write the state it returns.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(missing_docs_in_private_items)]

pub mod context;
pub mod dispatch;
pub mod error;
pub mod orchestrator;
pub mod stage_pipeline;

pub use context::build_context;
pub use dispatch::dispatch;
pub use dispatch::run_dispatch_loop;
pub use error::OrchestratorError;
pub use orchestrator::Orchestrator;

// crates/changegate-orchestrator/src/error.rs
// ============================================================================
// Module: Orchestrator Errors
// Description: The error taxonomy for every orchestrator-level operation.
// Purpose: Bridge `Store`/`Queues` failures into one type without ever
//          blanket-converting from an unrelated error.
// Dependencies: changegate-core, thiserror
// ============================================================================

//! ## Overview
//! [`OrchestratorError`] never wraps an opaque `anyhow::Error`; each variant
//! names the collaborator that failed, and the `From` bridges below are
//! written by hand rather than derived broadly.

use changegate_core::interfaces::QueueError;
use changegate_core::interfaces::StoreError;
use thiserror::Error;

/// Errors an [`crate::Orchestrator`] operation may return.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The store failed to load, persist, or query a row.
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    /// A decided job could not be published.
    #[error("queue failure: {0}")]
    Queue(#[from] QueueError),
    /// The caller supplied an event that does not apply to the workflow's
    /// current stage (e.g. approving a stage the workflow is not on).
    #[error("invalid stage transition: {0}")]
    InvalidStageTransition(String),
}

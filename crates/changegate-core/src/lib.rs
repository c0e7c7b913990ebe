// crates/changegate-core/src/lib.rs
// ============================================================================
// Module: Core
// Description: Data model, identifiers, canonical hashing, the transition
//              function, and the external-interface traits.
// Purpose: The pure, I/O-free heart of the workflow engine; every other
//          crate in the workspace depends on this one.
// Dependencies: serde, serde_json, serde_jcs, sha2, thiserror, async-trait
// ============================================================================

//! ## Overview
//! This crate has exactly one job: define what a workflow *is* and how it
//! *moves*, without deciding how any of it gets stored, queued, or rendered.
//! Nothing here reads a clock, opens a socket, or touches a filesystem;
//! [`transition::transition`] in particular is pure and total by
//! construction, not by convention, because its inputs (state, event,
//! context) are plain data and its output is plain data.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(missing_docs_in_private_items)]

pub mod hashing;
pub mod identifiers;
pub mod interfaces;
pub mod model;
pub mod time;
pub mod transition;

use thiserror::Error;

/// The crate-level error type, used only where a caller needs to unify
/// failures from more than one of this crate's own fallible operations
/// (currently just canonicalization). Most call sites use the narrower
/// per-module error types directly.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A canonicalization or hashing failure.
    #[error("hashing failed: {0}")]
    Hashing(#[from] hashing::HashingError),
}

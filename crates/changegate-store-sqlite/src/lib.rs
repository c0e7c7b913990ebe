// crates/changegate-store-sqlite/src/lib.rs
// ============================================================================
// Module: Changegate SQLite Store
// Description: A Store implementation backed by SQLite.
// Purpose: Give the orchestrator and workers a durable backend for the
//          workflow aggregate and its owned entities.
// Dependencies: changegate-core, rusqlite, serde_json, thiserror, tokio
// ============================================================================

//! ## Overview
//! This crate's only public surface is [`SqliteStore`]: the sole
//! [`changegate_core::interfaces::Store`] implementation in this workspace.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(missing_docs_in_private_items)]

mod store;

pub use store::SqliteStore;
pub use store::SqliteStoreConfig;
pub use store::SqliteStoreError;

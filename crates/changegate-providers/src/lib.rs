// crates/changegate-providers/src/lib.rs
// ============================================================================
// Module: Changegate Providers
// Description: Concrete LLMProvider and CodeHostClient implementations.
// Purpose: Give stage workers and the Write Gate real backends over HTTP,
//          with a zero-network stub standing in when no LLM credential is
//          configured.
// Dependencies: changegate-core, reqwest, serde_json, tokio
// ============================================================================

//! ## Overview
//! This crate ships the two provider implementations `changegate-worker` and
//! `changegate-orchestrator` run against: [`HttpLlmProvider`] /
//! [`StubLlmProvider`] for `LLMProvider`, and [`HttpCodeHostClient`] for
//! `CodeHostClient`. [`registry`] is where callers pick which `LLMProvider`
//! to construct and where `CodeHostClient` construction is centralized.
//!
//! Invariants:
//! - Every outbound LLM call honors a per-call timeout and bounded retry.
//! - Every outbound code host call passes through a single-flight rate
//!   limiter.
//! - Write methods on [`HttpCodeHostClient`] (`create_branch`, `update_file`,
//!   `open_pull_request`) check existing state before writing, so repeated
//!   calls with the same inputs are idempotent.

pub mod code_host;
pub mod llm;
pub mod registry;

pub use code_host::HttpCodeHostClient;
pub use code_host::HttpCodeHostConfig;
pub use llm::HttpLlmProvider;
pub use llm::HttpLlmProviderConfig;
pub use llm::StubLlmProvider;
pub use registry::build_code_host_client;
pub use registry::select_llm_provider;

// crates/changegate-providers/src/registry.rs
// ============================================================================
// Module: Provider Selection
// Description: Picks the concrete LLMProvider and CodeHostClient a worker
//              framework runs against.
// Purpose: Make "no LLM key configured" a deliberate, visible selection
//          rather than a runtime failure, and centralize CodeHostClient
//          construction.
// Dependencies: changegate-core
// ============================================================================

//! ## Overview
//! [`select_llm_provider`] is the resolved open question from `SPEC_FULL.md`
//! §4.4.1/§9: `allow_summary_fallback` and "no LLM key configured" are
//! independent, explicit settings. This function only handles the latter —
//! routing to [`StubLlmProvider`] when no credential is present — the former
//! is read by the stage workers that call the provider, not by provider
//! selection. [`build_code_host_client`] is the single place
//! [`HttpCodeHostClient`] gets constructed from configuration.

use std::sync::Arc;

use changegate_core::interfaces::CodeHostError;
use changegate_core::interfaces::LLMProvider;
use changegate_core::interfaces::ProviderError;

use crate::code_host::HttpCodeHostClient;
use crate::code_host::HttpCodeHostConfig;
use crate::llm::HttpLlmProvider;
use crate::llm::HttpLlmProviderConfig;
use crate::llm::StubLlmProvider;

/// Builds the [`LLMProvider`] a worker framework should run against:
/// [`HttpLlmProvider`] when `api_key` is present, [`StubLlmProvider`]
/// otherwise.
///
/// # Errors
///
/// Returns the underlying [`ProviderError`] if `api_key` is present but the
/// HTTP client cannot be constructed.
pub fn select_llm_provider(base_url: &str, api_key: Option<&str>, model: &str) -> Result<Arc<dyn LLMProvider>, ProviderError> {
    match api_key {
        Some(api_key) => {
            let provider = HttpLlmProvider::new(HttpLlmProviderConfig {
                base_url: base_url.to_owned(),
                api_key: api_key.to_owned(),
                model: model.to_owned(),
            })?;
            Ok(Arc::new(provider))
        }
        None => Ok(Arc::new(StubLlmProvider)),
    }
}

/// Builds the [`HttpCodeHostClient`] a worker framework should run against.
///
/// # Errors
///
/// Returns [`CodeHostError::Transient`] if the HTTP client cannot be
/// constructed.
pub fn build_code_host_client(base_url: &str, app_credential: &str) -> Result<Arc<HttpCodeHostClient>, CodeHostError> {
    let client = HttpCodeHostClient::new(HttpCodeHostConfig { base_url: base_url.to_owned(), app_credential: app_credential.to_owned() })?;
    Ok(Arc::new(client))
}

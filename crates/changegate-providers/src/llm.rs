// crates/changegate-providers/src/llm.rs
// ============================================================================
// Module: HTTP LLM Provider
// Description: The one concrete LLMProvider: a native async reqwest client
//              against an OpenAI-compatible chat-completions endpoint.
// Purpose: Give stage workers a real backend for LlmRequest/LlmResponse.
// Dependencies: changegate-core, reqwest, serde_json, tokio
// ============================================================================

//! ## Overview
//! [`HttpLlmProvider`] is the only non-stub [`LLMProvider`] implementation in
//! this workspace. It posts `LlmRequest` as an OpenAI-style chat-completions
//! body, retries transient network failures with bounded exponential
//! backoff, and honors a per-call timeout. [`StubLlmProvider`] is the other
//! half of the pair named in `§4.4.1`/`§9`: selected instead of this one when
//! no credential is configured, it returns a deterministic, schema-valid
//! "hold" response for every call rather than making a network request.

use std::time::Duration;

use async_trait::async_trait;
use changegate_core::interfaces::LLMProvider;
use changegate_core::interfaces::LlmRequest;
use changegate_core::interfaces::LlmResponse;
use changegate_core::interfaces::LlmUsage;
use changegate_core::interfaces::ProviderError;
use serde::Serialize;
use serde_json::Value;

/// Per-call request timeout (`SPEC_FULL.md` §5: "typically 60 seconds").
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
/// Maximum network-failure retry attempts (`SPEC_FULL.md` §5: "bounded (e.g., 3 attempts)").
const MAX_NETWORK_RETRIES: u32 = 3;
/// Base delay for exponential backoff between network retries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Configuration for [`HttpLlmProvider`].
#[derive(Debug, Clone)]
pub struct HttpLlmProviderConfig {
    /// Base URL of the chat-completions endpoint, e.g.
    /// `https://api.openai.com/v1`.
    pub base_url: String,
    /// Bearer credential sent as `Authorization: Bearer <key>`.
    pub api_key: String,
    /// Model identifier sent in every request body.
    pub model: String,
}

/// An [`LLMProvider`] backed by a real HTTP chat-completions endpoint.
pub struct HttpLlmProvider {
    /// Provider configuration (endpoint, credential, model).
    config: HttpLlmProviderConfig,
    /// The underlying async HTTP client.
    client: reqwest::Client,
}

impl HttpLlmProvider {
    /// Builds a provider from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Rejected`] if the HTTP client cannot be
    /// constructed.
    pub fn new(config: HttpLlmProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_CALL_TIMEOUT)
            .build()
            .map_err(|err| ProviderError::Rejected(format!("http client build failed: {err}")))?;
        Ok(Self { config, client })
    }

    /// Sends one request attempt, mapping transport/HTTP failures into
    /// [`ProviderError`].
    async fn send_once(&self, body: &ChatCompletionRequest) -> Result<LlmResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|err| ProviderError::Transient(format!("llm request failed: {err}")))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ProviderError::Transient(format!("llm endpoint returned {status}")));
        }
        if !status.is_success() {
            return Err(ProviderError::Rejected(format!("llm endpoint returned {status}")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| ProviderError::Transient(format!("llm response decode failed: {err}")))?;
        parse_chat_completion(&payload)
    }
}

#[async_trait]
impl LLMProvider for HttpLlmProvider {
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError> {
        let body = ChatCompletionRequest {
            model: self.config.model.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            messages: request
                .messages
                .iter()
                .map(|message| ChatMessage { role: message.role.clone(), content: message.content.clone() })
                .collect(),
        };

        let mut attempt = 0;
        loop {
            match self.send_once(&body).await {
                Ok(response) => return Ok(response),
                Err(ProviderError::Transient(reason)) if attempt + 1 < MAX_NETWORK_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt)).await;
                    let _ = reason;
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn estimate_tokens(&self, text: &str) -> u32 {
        // No tokenizer dependency exists anywhere in this workspace's stack;
        // a 4-characters-per-token heuristic is the same order-of-magnitude
        // estimate most chat-completion providers document for English text.
        u32::try_from(text.chars().count() / 4).unwrap_or(u32::MAX)
    }
}

/// A deterministic, zero-network [`LLMProvider`] used when no LLM credential
/// is configured. Every call returns a minimal schema-valid "hold" response
/// so a stage worker can still produce an artifact, tagged as
/// `source: "stub"` so the audit trail shows no real generation occurred.
pub struct StubLlmProvider;

#[async_trait]
impl LLMProvider for StubLlmProvider {
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError> {
        let hold = serde_json::json!({
            "status": "hold",
            "source": "stub",
            "role": request.role,
        });
        Ok(LlmResponse {
            raw_content: hold.to_string(),
            usage: LlmUsage::default(),
        })
    }

    fn estimate_tokens(&self, _text: &str) -> u32 {
        0
    }
}

/// The OpenAI-compatible chat-completions request body.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    /// Model identifier.
    model: String,
    /// Sampling temperature.
    temperature: f32,
    /// Maximum tokens to generate.
    max_tokens: u32,
    /// Conversation messages.
    messages: Vec<ChatMessage>,
}

/// One chat message in a [`ChatCompletionRequest`].
#[derive(Debug, Serialize)]
struct ChatMessage {
    /// Message role (`"system"`, `"user"`, `"assistant"`).
    role: String,
    /// Message content.
    content: String,
}

/// Extracts the first choice's content and token usage from an
/// OpenAI-compatible chat-completions response body.
fn parse_chat_completion(payload: &Value) -> Result<LlmResponse, ProviderError> {
    let content = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Rejected("llm response missing choices[0].message.content".to_owned()))?;

    let usage = payload.get("usage").map_or(LlmUsage::default(), |usage| LlmUsage {
        input_tokens: usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
    });

    Ok(LlmResponse { raw_content: content.to_owned(), usage })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "test assertions")]

    use super::*;

    #[test]
    fn parses_a_well_formed_chat_completion() {
        let payload = serde_json::json!({
            "choices": [{"message": {"content": "hello"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5},
        });
        let response = parse_chat_completion(&payload).expect("parses");
        assert_eq!(response.raw_content, "hello");
        assert_eq!(response.usage.input_tokens, 10);
        assert_eq!(response.usage.output_tokens, 5);
    }

    #[test]
    fn missing_content_is_rejected_not_retried() {
        let payload = serde_json::json!({"choices": []});
        let result = parse_chat_completion(&payload);
        assert!(matches!(result, Err(ProviderError::Rejected(_))));
    }

    #[tokio::test]
    async fn stub_provider_returns_a_hold_response_tagged_as_stub() {
        let provider = StubLlmProvider;
        let response = provider
            .call(LlmRequest {
                role: "feasibility".to_owned(),
                prompt_version: "v1".to_owned(),
                messages: Vec::new(),
                max_tokens: 100,
                temperature: 0.0,
            })
            .await
            .expect("stub never fails");
        assert!(response.raw_content.contains("\"source\":\"stub\""));
        assert_eq!(response.usage, LlmUsage::default());
    }

    #[test]
    fn token_estimate_is_roughly_four_chars_per_token() {
        let provider_config =
            HttpLlmProviderConfig { base_url: "https://example.invalid".to_owned(), api_key: "k".to_owned(), model: "m".to_owned() };
        let provider = HttpLlmProvider::new(provider_config).expect("client builds");
        assert_eq!(provider.estimate_tokens("abcdefgh"), 2);
    }
}

// crates/changegate-worker/src/llm_stage.rs
// ============================================================================
// Module: LLM Artifact Production Sub-Protocol
// Description: The shared build-prompt/call/parse/validate/retry/fallback
//              sequence every LLM-backed stage follows.
// Purpose: Implement the six-step sub-protocol once so individual stages
//          only supply a prompt and a schema.
// Dependencies: changegate-core, serde_json
// ============================================================================

//! ## Overview
//! [`run_llm_stage`] is the only entry point: it builds the prompt, calls
//! the configured [`changegate_core::interfaces::LLMProvider`], tolerates a
//! response wrapped in a Markdown code fence, validates against the stage's
//! schema, and on a first failure builds a retry prompt embedding the
//! original response and the validator's own error list. A second failure
//! either emits a minimal "hold" artifact (if `allow_summary_fallback` is
//! set) or propagates, entering the stage worker's failure path.

use changegate_core::identifiers::StageName;
use changegate_core::interfaces::LLMProvider;
use changegate_core::interfaces::LlmMessage;
use changegate_core::interfaces::LlmRequest;
use changegate_core::interfaces::LlmUsage;
use changegate_core::interfaces::ProviderError;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;

use crate::schema::SchemaError;
use crate::schema::SchemaRegistry;
use crate::schema::ValidationFailure;

/// The maximum tokens requested on the first call for a stage.
const DEFAULT_MAX_TOKENS: u32 = 2_000;
/// The maximum tokens requested on the retry call; intentionally smaller.
const RETRY_MAX_TOKENS: u32 = 800;
/// Sampling temperature used for every stage call.
const DEFAULT_TEMPERATURE: f32 = 0.2;

/// Errors raised while producing an LLM-backed artifact.
#[derive(Debug, Error)]
pub enum LlmStageError {
    /// The provider rejected the request or failed after retries.
    #[error("llm provider failure: {0}")]
    Provider(#[from] ProviderError),
    /// The response could not be parsed as JSON even after stripping a code
    /// fence.
    #[error("response was not valid json: {0}")]
    InvalidJson(String),
    /// The response failed schema validation twice and no fallback is
    /// configured.
    #[error("artifact failed validation twice: {0:?}")]
    ValidationFailed(Vec<ValidationFailure>),
    /// The stage's schema could not be applied.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
}

/// Token usage and provenance recorded for one stage's LLM calls.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LlmStageUsage {
    /// Total input tokens across every call this stage made.
    pub input_tokens: u64,
    /// Total output tokens across every call this stage made.
    pub output_tokens: u64,
    /// `true` if a stub provider produced the artifact (no credential
    /// configured).
    pub from_stub: bool,
    /// `true` if the fallback "hold" artifact was emitted after two
    /// validation failures.
    pub from_fallback: bool,
}

/// The result of running the sub-protocol for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmStageResult {
    /// The validated artifact content.
    pub artifact: Value,
    /// Usage and provenance.
    pub usage: LlmStageUsage,
}

/// Runs the shared artifact-production sub-protocol for `stage`.
///
/// `build_prompt` constructs the initial messages from the stage's gathered
/// inputs; it is called once, up front.
///
/// # Errors
///
/// Returns [`LlmStageError`] if the provider fails without a configured
/// fallback, the response is not parseable JSON, or validation fails twice
/// with fallback disabled.
pub async fn run_llm_stage(
    provider: &dyn LLMProvider,
    schemas: &SchemaRegistry,
    stage: StageName,
    prompt_version: &str,
    messages: Vec<LlmMessage>,
    allow_summary_fallback: bool,
) -> Result<LlmStageResult, LlmStageError> {
    let mut usage = LlmStageUsage::default();

    let first_request = LlmRequest {
        role: stage.as_str().to_owned(),
        prompt_version: prompt_version.to_owned(),
        messages,
        max_tokens: DEFAULT_MAX_TOKENS,
        temperature: DEFAULT_TEMPERATURE,
    };
    let first_response = provider.call(first_request.clone()).await?;
    record_usage(&mut usage, first_response.usage);

    let parsed = parse_json_response(&first_response.raw_content);
    let first_failures = match &parsed {
        Ok(value) => schemas.validate(stage, value)?,
        Err(_) => vec![ValidationFailure { path: String::new(), message: "response was not valid json".to_owned() }],
    };

    if first_failures.is_empty()
        && let Ok(value) = parsed
    {
        return Ok(LlmStageResult { artifact: value, usage });
    }

    let retry_messages = build_retry_messages(&first_request, &first_response.raw_content, &first_failures);
    let retry_request = LlmRequest {
        role: first_request.role,
        prompt_version: first_request.prompt_version,
        messages: retry_messages,
        max_tokens: RETRY_MAX_TOKENS,
        temperature: DEFAULT_TEMPERATURE,
    };
    let retry_response = provider.call(retry_request).await?;
    record_usage(&mut usage, retry_response.usage);

    let retry_parsed = parse_json_response(&retry_response.raw_content);
    let retry_failures = match &retry_parsed {
        Ok(value) => schemas.validate(stage, value)?,
        Err(_) => vec![ValidationFailure { path: String::new(), message: "retry response was not valid json".to_owned() }],
    };

    if retry_failures.is_empty()
        && let Ok(value) = retry_parsed
    {
        return Ok(LlmStageResult { artifact: value, usage });
    }

    if allow_summary_fallback {
        usage.from_fallback = true;
        return Ok(LlmStageResult { artifact: hold_artifact(stage), usage });
    }

    Err(LlmStageError::ValidationFailed(retry_failures))
}

/// Adds `reported` usage to the running `usage` total.
fn record_usage(usage: &mut LlmStageUsage, reported: LlmUsage) {
    usage.input_tokens += reported.input_tokens;
    usage.output_tokens += reported.output_tokens;
}

/// Parses `raw` as JSON, stripping a wrapping Markdown code fence
/// (` ```json ... ``` ` or ` ``` ... ``` `) if present.
fn parse_json_response(raw: &str) -> Result<Value, serde_json::Error> {
    let trimmed = raw.trim();
    let unfenced = strip_code_fence(trimmed);
    serde_json::from_str(unfenced)
}

/// Strips a single wrapping Markdown code fence from `text`, if present.
fn strip_code_fence(text: &str) -> &str {
    let Some(after_open) = text.strip_prefix("```") else { return text };
    let after_lang = after_open.strip_prefix("json").unwrap_or(after_open);
    let body = after_lang.strip_prefix('\n').unwrap_or(after_lang);
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Builds the retry prompt: the original conversation, the original raw
/// response, and the validator's own failure list.
fn build_retry_messages(original: &LlmRequest, original_response: &str, failures: &[ValidationFailure]) -> Vec<LlmMessage> {
    let mut messages = original.messages.clone();
    messages.push(LlmMessage { role: "assistant".to_owned(), content: original_response.to_owned() });
    let failure_lines: Vec<String> = failures.iter().map(|f| format!("- {}: {}", f.path, f.message)).collect();
    messages.push(LlmMessage {
        role: "user".to_owned(),
        content: format!(
            "Your previous response did not match the required schema. Return corrected JSON only.\n\nValidation errors:\n{}",
            failure_lines.join("\n")
        ),
    });
    messages
}

/// Produces the minimal, always-schema-valid "hold" artifact emitted when
/// the fallback path is taken.
fn hold_artifact(stage: StageName) -> Value {
    json!({
        "summary": format!("{} stage artifact withheld after repeated validation failure", stage.as_str()),
        "risks": [],
        "hold": true,
        "source": "fallback",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_code_fence() {
        let fenced = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_code_fence(fenced), "{\"a\":1}");
    }

    #[test]
    fn strips_plain_code_fence() {
        let fenced = "```\n{\"a\":1}\n```";
        assert_eq!(strip_code_fence(fenced), "{\"a\":1}");
    }

    #[test]
    fn leaves_unfenced_text_untouched() {
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn hold_artifact_carries_fallback_source() {
        let artifact = hold_artifact(StageName::Feasibility);
        assert_eq!(artifact["source"], "fallback");
        assert_eq!(artifact["hold"], true);
    }
}

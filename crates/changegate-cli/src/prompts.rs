// crates/changegate-cli/src/prompts.rs
// ============================================================================
// Module: LLM Stage Schemas and Prompts
// Description: The shared artifact schema and per-stage prompt-building
//              closures for the four LLM-backed stages.
// Purpose: One place to change what feasibility/architecture/timeline/
//          summary ask the provider for, without touching the stage
//          worker framework itself.
// Dependencies: changegate-core, changegate-worker, serde_json
// ============================================================================

//! ## Overview
//! Every LLM-backed stage shares one artifact shape — a free-text
//! `summary` plus a `risks` list — since `SPEC_FULL.md` does not
//! distinguish their artifact schemas beyond that. Each stage still gets
//! its own prompt, built from the gathered [`StageInputs`] rather than a
//! shared template string.

use std::sync::Arc;

use changegate_core::identifiers::StageName;
use changegate_core::interfaces::LlmMessage;
use changegate_worker::stage_worker::StageInputs;
use changegate_worker::stages::llm_stages::PromptBuilder;
use serde_json::Value;
use serde_json::json;

/// The artifact schema shared by every LLM-backed stage.
#[must_use]
pub fn stage_artifact_schema() -> Value {
    json!({
        "type": "object",
        "required": ["summary", "risks"],
        "properties": {
            "summary": {"type": "string"},
            "risks": {"type": "array", "items": {"type": "string"}},
        },
    })
}

/// The `(stage, schema)` pairs every LLM-backed stage is compiled with.
#[must_use]
pub fn stage_schemas() -> Vec<(StageName, Value)> {
    vec![
        (StageName::Feasibility, stage_artifact_schema()),
        (StageName::Architecture, stage_artifact_schema()),
        (StageName::Timeline, stage_artifact_schema()),
        (StageName::Summary, stage_artifact_schema()),
    ]
}

/// Renders the feedback line appended to a prompt when the workflow carries
/// human feedback from a prior change request.
fn feedback_line(inputs: &StageInputs) -> String {
    inputs.workflow.feedback.as_deref().map_or_else(String::new, |feedback| format!("\nPrior feedback to address: {feedback}"))
}

/// Builds the feasibility stage's prompt.
#[must_use]
pub fn feasibility_prompt_builder() -> PromptBuilder {
    Arc::new(|inputs: &StageInputs| {
        vec![LlmMessage {
            role: "user".to_owned(),
            content: format!(
                "Assess the feasibility of: {}\nBusiness justification: {}{}\nRespond with JSON: {{\"summary\": string, \"risks\": [string]}}.",
                inputs.workflow.feature_goal,
                inputs.workflow.business_justification,
                feedback_line(inputs)
            ),
        }]
    })
}

/// Builds the architecture stage's prompt.
#[must_use]
pub fn architecture_prompt_builder() -> PromptBuilder {
    Arc::new(|inputs: &StageInputs| {
        vec![LlmMessage {
            role: "user".to_owned(),
            content: format!(
                "Propose an implementation architecture for: {}{}\nRespond with JSON: {{\"summary\": string, \"risks\": [string]}}.",
                inputs.workflow.feature_goal,
                feedback_line(inputs)
            ),
        }]
    })
}

/// Builds the timeline stage's prompt.
#[must_use]
pub fn timeline_prompt_builder() -> PromptBuilder {
    Arc::new(|inputs: &StageInputs| {
        vec![LlmMessage {
            role: "user".to_owned(),
            content: format!(
                "Estimate a delivery timeline for: {}{}\nRespond with JSON: {{\"summary\": string, \"risks\": [string]}}.",
                inputs.workflow.feature_goal,
                feedback_line(inputs)
            ),
        }]
    })
}

/// Builds the summary stage's prompt.
#[must_use]
pub fn summary_prompt_builder() -> PromptBuilder {
    Arc::new(|inputs: &StageInputs| {
        vec![LlmMessage {
            role: "user".to_owned(),
            content: format!(
                "Summarize the proposed change for sign-off: {}{}\nRespond with JSON: {{\"summary\": string, \"risks\": [string]}}.",
                inputs.workflow.feature_goal,
                feedback_line(inputs)
            ),
        }]
    })
}

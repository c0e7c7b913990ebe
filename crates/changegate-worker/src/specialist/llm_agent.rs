// crates/changegate-worker/src/specialist/llm_agent.rs
// ============================================================================
// Module: LLM-Backed Specialist Agent
// Description: A SpecialistAgent that proposes patches by calling an
//              LLMProvider directly, without going through the artifact
//              production sub-protocol (no stage artifact, no schema).
// Purpose: Give the patches stage a concrete, registerable agent for each
//          AgentType rather than leaving SpecialistRegistry permanently
//          empty.
// Dependencies: changegate-core, async-trait, serde_json
// ============================================================================

//! ## Overview
//! [`LlmSpecialistAgent`] self-reports a confidence score from its declared
//! [`AgentCapabilities`] and, when dispatched, asks the configured
//! [`LLMProvider`] for a small JSON object describing one patch. A
//! malformed or empty response degrades to an empty-diff [`Proposal`]
//! rather than failing the whole dispatch, since one agent's bad output
//! should not sink [`crate::specialist::run_dispatch`] for the others.

use std::sync::Arc;

use async_trait::async_trait;
use changegate_core::identifiers::AgentId;
use changegate_core::identifiers::PatchId;
use changegate_core::interfaces::LLMProvider;
use changegate_core::interfaces::LlmMessage;
use changegate_core::interfaces::LlmRequest;
use changegate_core::model::FileAction;
use changegate_core::model::Patch;
use changegate_core::model::PatchFileChange;
use changegate_core::model::RiskLevel;
use serde_json::Value;

use crate::specialist::registry::AgentCapabilities;
use crate::specialist::registry::AgentType;
use crate::specialist::registry::SpecialistAgent;
use crate::specialist::strategy::Proposal;
use crate::specialist::strategy::ProposalContext;

/// The temperature used for every specialist proposal call; low, since a
/// patch proposal benefits less from sampling diversity than a design
/// artifact does.
const PROPOSAL_TEMPERATURE: f32 = 0.1;
/// Token ceiling for a single specialist proposal call.
const PROPOSAL_MAX_TOKENS: u32 = 1_500;

/// A specialist agent that proposes one patch per dispatch by prompting an
/// [`LLMProvider`] directly.
pub struct LlmSpecialistAgent {
    /// Stable identifier, e.g. `"backend-llm"`.
    id: AgentId,
    /// The kind of specialist this agent declares itself as.
    agent_type: AgentType,
    /// Declared languages/file-glob affinities.
    capabilities: AgentCapabilities,
    /// Human-readable description surfaced in diagnostics.
    description: String,
    /// The provider this agent calls for proposals.
    provider: Arc<dyn LLMProvider>,
}

impl LlmSpecialistAgent {
    /// Creates an agent of `agent_type`, identified by `id`, calling
    /// `provider` for proposals.
    #[must_use]
    pub fn new(id: impl Into<String>, agent_type: AgentType, capabilities: AgentCapabilities, description: impl Into<String>, provider: Arc<dyn LLMProvider>) -> Self {
        Self { id: AgentId::new(id), agent_type, capabilities, description: description.into(), provider }
    }

    /// Builds the proposal prompt from `ctx`.
    fn build_messages(&self, ctx: &ProposalContext) -> Vec<LlmMessage> {
        let files = if ctx.task.target_files.is_empty() { "no specific files named".to_owned() } else { ctx.task.target_files.join(", ") };
        vec![LlmMessage {
            role: "user".to_owned(),
            content: format!(
                "Propose one patch for: {}\nTarget files: {files}\nRespond with JSON: {{\"title\", \"summary\", \"diff\", \"risk_level\": \"low\"|\"medium\"|\"high\", \"adds_tests\": bool}}.",
                ctx.task.description
            ),
        }]
    }
}

#[async_trait]
impl SpecialistAgent for LlmSpecialistAgent {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    fn capabilities(&self) -> &AgentCapabilities {
        &self.capabilities
    }

    fn describe(&self) -> &str {
        &self.description
    }

    async fn validate(&self, ctx: &ProposalContext) -> Result<f64, String> {
        let base = if self.agent_type == ctx.task.task_type { 0.8 } else { 0.4 };
        Ok(base)
    }

    async fn propose(&self, ctx: &ProposalContext) -> Result<Proposal, String> {
        let request = LlmRequest { role: "patches".to_owned(), prompt_version: "v1".to_owned(), messages: self.build_messages(ctx), max_tokens: PROPOSAL_MAX_TOKENS, temperature: PROPOSAL_TEMPERATURE };
        let response = self.provider.call(request).await.map_err(|err| err.to_string())?;
        let parsed: Value = serde_json::from_str(response.raw_content.trim()).unwrap_or(Value::Null);

        let title = parsed.get("title").and_then(Value::as_str).unwrap_or("proposed change").to_owned();
        let summary = parsed.get("summary").and_then(Value::as_str).unwrap_or_default().to_owned();
        let diff = parsed.get("diff").and_then(Value::as_str).unwrap_or_default().to_owned();
        let adds_tests = parsed.get("adds_tests").and_then(Value::as_bool).unwrap_or(false);
        let risk_level = match parsed.get("risk_level").and_then(Value::as_str) {
            Some("high") => RiskLevel::High,
            Some("medium") => RiskLevel::Medium,
            _ => RiskLevel::Low,
        };
        let files = ctx
            .task
            .target_files
            .iter()
            .map(|path| PatchFileChange { path: path.clone(), action: FileAction::Modify, additions: 0, deletions: 0 })
            .collect();

        Ok(Proposal {
            agent_id: self.id.clone(),
            patches: vec![Patch {
                id: PatchId::new(format!("{}:{}", self.id, title.to_lowercase().replace(' ', "-"))),
                task_id: None,
                proposed_by: Some(self.id.clone()),
                title,
                summary,
                diff,
                files,
                adds_tests,
                risk_level,
                proposed_commands: Vec::new(),
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "test assertions")]

    use async_trait::async_trait;
    use changegate_core::interfaces::LlmResponse;
    use changegate_core::interfaces::LlmUsage;
    use changegate_core::interfaces::ProviderError;
    use serde_json::json;

    use super::*;
    use crate::specialist::strategy::Task;

    struct StubProvider {
        raw: String,
    }

    #[async_trait]
    impl LLMProvider for StubProvider {
        async fn call(&self, _request: LlmRequest) -> Result<LlmResponse, ProviderError> {
            Ok(LlmResponse { raw_content: self.raw.clone(), usage: LlmUsage { input_tokens: 1, output_tokens: 1 } })
        }

        fn estimate_tokens(&self, text: &str) -> u32 {
            u32::try_from(text.len()).unwrap_or(u32::MAX)
        }
    }

    fn ctx() -> ProposalContext {
        ProposalContext { task: Task { task_type: AgentType::Backend, description: "add a widget".to_owned(), target_files: vec!["src/lib.rs".to_owned()] }, detected_language: None, prior_patches: Vec::new() }
    }

    #[tokio::test]
    async fn proposes_a_patch_from_a_well_formed_response() {
        let raw = json!({"title": "Add widget", "summary": "adds a widget", "diff": "diff --git a/x b/x", "risk_level": "low", "adds_tests": true}).to_string();
        let agent = LlmSpecialistAgent::new("backend-llm", AgentType::Backend, AgentCapabilities::default(), "backend specialist", Arc::new(StubProvider { raw }));
        let proposal = agent.propose(&ctx()).await.expect("proposes");
        assert_eq!(proposal.patches.len(), 1);
        assert!(proposal.patches[0].adds_tests);
    }

    #[tokio::test]
    async fn malformed_response_degrades_to_an_empty_patch_instead_of_failing() {
        let agent = LlmSpecialistAgent::new("backend-llm", AgentType::Backend, AgentCapabilities::default(), "backend specialist", Arc::new(StubProvider { raw: "not json".to_owned() }));
        let proposal = agent.propose(&ctx()).await.expect("proposes");
        assert_eq!(proposal.patches[0].diff, "");
    }

    #[tokio::test]
    async fn validate_scores_matching_task_type_higher() {
        let agent = LlmSpecialistAgent::new("backend-llm", AgentType::Backend, AgentCapabilities::default(), "backend specialist", Arc::new(StubProvider { raw: "{}".to_owned() }));
        let matching = agent.validate(&ctx()).await.expect("validates");
        let mut mismatched_ctx = ctx();
        mismatched_ctx.task.task_type = AgentType::Frontend;
        let mismatched = agent.validate(&mismatched_ctx).await.expect("validates");
        assert!(matching > mismatched);
    }
}

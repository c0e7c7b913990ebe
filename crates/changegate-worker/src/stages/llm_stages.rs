// crates/changegate-worker/src/stages/llm_stages.rs
// ============================================================================
// Module: LLM-Backed Stage Worker
// Description: One StageWorker implementation generic over the four
//              LLM-backed stages (feasibility, architecture, timeline,
//              summary); only the prompt-building closure differs per stage.
// Purpose: Avoid four near-identical StageWorker impls that would each
//          reimplement the artifact-production sub-protocol.
// Dependencies: changegate-core, async-trait, bigdecimal, serde_json
// ============================================================================

//! ## Overview
//! [`LlmStageWorker`] wraps [`crate::llm_stage::run_llm_stage`]: it supplies
//! the provider, the compiled [`crate::schema::SchemaRegistry`], and a
//! per-stage prompt-building closure, and consults an optional
//! [`crate::cost_tracker::CostTracker`] before the first call so an
//! over-budget workflow fails fast with a readable message instead of
//! spending tokens it cannot afford.

use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use changegate_core::identifiers::StageName;
use changegate_core::interfaces::LLMProvider;
use changegate_core::interfaces::LlmMessage;
use changegate_core::model::ArtifactKind;
use serde_json::Value;

use crate::cost_tracker::BudgetDecision;
use crate::cost_tracker::CostTracker;
use crate::llm_stage::run_llm_stage;
use crate::schema::SchemaRegistry;
use crate::stage_worker::StageInputs;
use crate::stage_worker::StageWorker;

/// Builds the initial prompt messages for one stage from its gathered
/// inputs.
pub type PromptBuilder = Arc<dyn Fn(&StageInputs) -> Vec<LlmMessage> + Send + Sync>;

/// A StageWorker generic over any LLM-backed stage; only `prompt_builder`
/// and the bound `stage`/`artifact_kind` vary across feasibility,
/// architecture, timeline, and summary.
pub struct LlmStageWorker {
    /// The stage this worker is bound to.
    stage: StageName,
    /// The artifact kind this stage produces.
    artifact_kind: ArtifactKind,
    /// The prompt version recorded on every LLM request.
    prompt_version: String,
    /// The provider to call; a stub implementation when no credential is
    /// configured, per the stub/fallback configuration knobs.
    provider: Arc<dyn LLMProvider>,
    /// Compiled per-stage schemas, shared across every LLM-backed worker.
    schemas: Arc<SchemaRegistry>,
    /// Whether a second validation failure emits a "hold" artifact instead
    /// of propagating.
    allow_summary_fallback: bool,
    /// Optional token-budget ceilings consulted before each call.
    cost_tracker: Option<Arc<CostTracker>>,
    /// Builds the stage's initial prompt from its gathered inputs.
    prompt_builder: PromptBuilder,
}

impl LlmStageWorker {
    /// Creates a worker for one LLM-backed stage.
    #[must_use]
    #[allow(clippy::too_many_arguments, reason = "every field is a distinct, independently-configured collaborator")]
    pub fn new(
        stage: StageName,
        artifact_kind: ArtifactKind,
        prompt_version: impl Into<String>,
        provider: Arc<dyn LLMProvider>,
        schemas: Arc<SchemaRegistry>,
        allow_summary_fallback: bool,
        cost_tracker: Option<Arc<CostTracker>>,
        prompt_builder: PromptBuilder,
    ) -> Self {
        Self {
            stage,
            artifact_kind,
            prompt_version: prompt_version.into(),
            provider,
            schemas,
            allow_summary_fallback,
            cost_tracker,
            prompt_builder,
        }
    }
}

#[async_trait]
impl StageWorker for LlmStageWorker {
    fn stage(&self) -> StageName {
        self.stage
    }

    fn artifact_kind(&self) -> ArtifactKind {
        self.artifact_kind
    }

    async fn process_artifact(&self, inputs: &StageInputs) -> Result<Value, String> {
        let messages = (self.prompt_builder)(inputs);

        if let Some(tracker) = &self.cost_tracker {
            let estimated: u32 = messages.iter().map(|message| self.provider.estimate_tokens(&message.content)).sum();
            if let BudgetDecision::Deny { ceiling_name } = tracker.check_budget(&inputs.workflow.id, u64::from(estimated)) {
                return Err(format!("{} stage would exceed {ceiling_name}", self.stage.as_str()));
            }
        }

        let result = run_llm_stage(self.provider.as_ref(), &self.schemas, self.stage, &self.prompt_version, messages, self.allow_summary_fallback)
            .await
            .map_err(|err| err.to_string())?;

        if let Some(tracker) = &self.cost_tracker {
            let total_tokens = result.usage.input_tokens + result.usage.output_tokens;
            tracker.record_spend(&inputs.workflow.id, "unaccounted", total_tokens, &BigDecimal::from(0));
        }

        Ok(result.artifact)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use changegate_core::interfaces::LlmRequest;
    use changegate_core::interfaces::LlmResponse;
    use changegate_core::interfaces::LlmUsage;
    use changegate_core::interfaces::ProviderError;
    use changegate_core::model::Repo;
    use changegate_core::model::StageStatus;
    use changegate_core::model::Workflow;
    use changegate_core::model::WorkflowState;
    use changegate_core::time::Timestamp;
    use serde_json::json;

    use super::*;

    struct StubProvider;

    #[async_trait]
    impl LLMProvider for StubProvider {
        async fn call(&self, _request: LlmRequest) -> Result<LlmResponse, ProviderError> {
            Ok(LlmResponse {
                raw_content: json!({"summary": "looks feasible", "risks": []}).to_string(),
                usage: LlmUsage { input_tokens: 10, output_tokens: 5 },
            })
        }

        fn estimate_tokens(&self, text: &str) -> u32 {
            u32::try_from(text.len() / 4).unwrap_or(u32::MAX)
        }
    }

    fn schemas() -> Arc<SchemaRegistry> {
        let schema = json!({
            "type": "object",
            "required": ["summary", "risks"],
            "properties": {"summary": {"type": "string"}, "risks": {"type": "array"}},
        });
        Arc::new(SchemaRegistry::compile(&[(StageName::Feasibility, schema)]).expect("compiles"))
    }

    fn workflow(now: Timestamp) -> Workflow {
        Workflow {
            id: changegate_core::identifiers::WorkflowId::new("wf-1"),
            state: WorkflowState::Ingested,
            stage: StageName::Feasibility,
            stage_status: StageStatus::Processing,
            feature_goal: "add widgets".to_owned(),
            business_justification: "customer ask".to_owned(),
            repos: vec![Repo { owner: "acme".to_owned(), name: "widgets".to_owned(), base_branch: "main".to_owned(), role: "primary".to_owned() }],
            feedback: None,
            created_at: now,
            updated_at: now,
            base_sha: Some("abc123".to_owned()),
        }
    }

    #[tokio::test]
    async fn produces_a_schema_valid_artifact() {
        let now = Timestamp::from_unix_millis(1_000);
        let inputs = StageInputs { workflow: workflow(now), prior_artifacts: Vec::new(), payload: json!({}) };
        let builder: PromptBuilder = Arc::new(|stage_inputs: &StageInputs| {
            vec![LlmMessage { role: "user".to_owned(), content: stage_inputs.workflow.feature_goal.clone() }]
        });
        let worker = LlmStageWorker::new(
            StageName::Feasibility,
            ArtifactKind::FeasibilityV1,
            "v1",
            Arc::new(StubProvider),
            schemas(),
            false,
            None,
            builder,
        );
        let artifact = worker.process_artifact(&inputs).await.expect("succeeds");
        assert_eq!(artifact["summary"], "looks feasible");
    }

    #[tokio::test]
    async fn over_budget_request_fails_before_calling_the_provider() {
        let now = Timestamp::from_unix_millis(1_000);
        let inputs = StageInputs { workflow: workflow(now), prior_artifacts: Vec::new(), payload: json!({}) };
        let builder: PromptBuilder = Arc::new(|_: &StageInputs| vec![LlmMessage { role: "user".to_owned(), content: "x".repeat(10_000) }]);
        let tracker = Arc::new(CostTracker::new(crate::cost_tracker::CostCeilings {
            per_run_tokens: Some(10),
            per_workflow_tokens: None,
            per_workflow_cost: None,
            per_day_cost: None,
        }));
        let worker = LlmStageWorker::new(
            StageName::Feasibility,
            ArtifactKind::FeasibilityV1,
            "v1",
            Arc::new(StubProvider),
            schemas(),
            false,
            Some(tracker),
            builder,
        );
        let result = worker.process_artifact(&inputs).await;
        assert!(result.is_err());
    }
}

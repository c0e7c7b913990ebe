// crates/changegate-cli/src/system.rs
// ============================================================================
// Module: System Assembly
// Description: Builds the store, queues, providers, orchestrator, and the
//              stage/job worker registries from a loaded configuration.
// Purpose: One place that wires every collaborator together, so `serve` and
//          the one-shot `workflow run-stage` command build the exact same
//          worker set from the exact same configuration.
// Dependencies: changegate-broker, changegate-config, changegate-core,
//               changegate-orchestrator, changegate-policy,
//               changegate-providers, changegate-store-sqlite,
//               changegate-worker
// ============================================================================

//! ## Overview
//! [`System::assemble`] is the composition root: it loads no configuration
//! itself, it only turns an already-loaded [`ChangegateConfig`] into live
//! collaborators. The gated stages run behind [`changegate_worker::stages::WriteGate`]
//! so no code host write escapes the `apply_patches` approval check.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use changegate_broker::InMemoryQueues;
use changegate_broker::QueueBrokerBuilder;
use changegate_broker::QueueSubscriptions;
use changegate_config::ChangegateConfig;
use changegate_core::identifiers::StageName;
use changegate_core::interfaces::CodeHostClient;
use changegate_core::interfaces::LLMProvider;
use changegate_core::interfaces::Queues;
use changegate_core::interfaces::Store;
use changegate_core::model::ArtifactKind;
use changegate_orchestrator::Orchestrator;
use changegate_providers::build_code_host_client;
use changegate_providers::registry::select_llm_provider;
use changegate_store_sqlite::SqliteStore;
use changegate_store_sqlite::SqliteStoreConfig;
use changegate_worker::CostCeilings;
use changegate_worker::CostTracker;
use changegate_worker::RunRecorder;
use changegate_worker::SchemaRegistry;
use changegate_worker::specialist::AgentCapabilities;
use changegate_worker::specialist::AgentType;
use changegate_worker::specialist::LlmSpecialistAgent;
use changegate_worker::specialist::SpecialistRegistry;
use changegate_worker::specialist::SpecialistRegistryBuilder;
use changegate_worker::stage_worker::JobWorker;
use changegate_worker::stage_worker::StageWorker;
use changegate_worker::stages::ApplyPatchesWorker;
use changegate_worker::stages::EvaluatePolicyWorker;
use changegate_worker::stages::IngestWorker;
use changegate_worker::stages::LlmStageWorker;
use changegate_worker::stages::PatchesWorker;
use changegate_worker::stages::PolicyWorker;
use changegate_worker::stages::PrWorker;
use changegate_worker::stages::SandboxWorker;
use changegate_worker::stages::WriteGate;

use crate::output::CliError;
use crate::prompts;

/// The queue `ingest_context`/`evaluate_policy`/`apply_patches` jobs are
/// published onto and consumed from; `transition.rs`'s `WORKFLOW_QUEUE`
/// constant is private, so this literal is this crate's own copy of it.
pub const WORKFLOW_QUEUE: &str = "workflow";
/// The queue stage/job completions are published onto for the orchestrator
/// to interpret via `changegate_orchestrator::dispatch`.
pub const ORCHESTRATOR_QUEUE: &str = "orchestrator";

/// Every collaborator a running deployment or a one-shot command needs.
pub struct System {
    /// The durable store.
    pub store: Arc<dyn Store>,
    /// The job broker.
    pub queues: Arc<dyn Queues>,
    /// The orchestrator, wired to `store`/`queues`.
    pub orchestrator: Arc<Orchestrator>,
    /// Run bookkeeping, shared by every worker invocation.
    pub run_recorder: RunRecorder,
    /// One `StageWorker` per gated pipeline stage.
    pub stage_workers: BTreeMap<StageName, Arc<dyn StageWorker>>,
    /// One `JobWorker` per automatic job name.
    pub job_workers: BTreeMap<String, Arc<dyn JobWorker>>,
}

impl System {
    /// Assembles a [`System`] plus the queue subscriptions its `serve`
    /// caller drains, from a fully loaded and validated `config`.
    ///
    /// # Errors
    ///
    /// Returns [`CliError`] if the store cannot be opened or a provider
    /// fails to construct.
    pub fn assemble(config: &ChangegateConfig) -> Result<(Self, QueueSubscriptions), CliError> {
        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::open(&SqliteStoreConfig { path: PathBuf::from(&config.store.connection), busy_timeout_ms: 5_000 })
                .map_err(CliError::from_display)?,
        );

        let mut broker = QueueBrokerBuilder::new(config.queues.default_capacity).queue(WORKFLOW_QUEUE).queue(ORCHESTRATOR_QUEUE);
        for (name, capacity) in &config.queues.capacities {
            broker = broker.queue_with_capacity(name.clone(), *capacity);
        }
        let (queues, subscriptions): (InMemoryQueues, QueueSubscriptions) = broker.build();
        let queues: Arc<dyn Queues> = Arc::new(queues);

        let llm_provider = select_llm_provider(&config.llm.base_url, config.llm.api_key.as_deref(), &config.llm.model).map_err(CliError::from_display)?;
        let code_host_client = build_code_host_client(&config.code_host.base_url, config.code_host.app_credential.as_deref().unwrap_or_default()).map_err(CliError::from_display)?;
        let code_host: Arc<dyn CodeHostClient> = Arc::new(WriteGate::new(code_host_client, Arc::clone(&store)));

        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&store), Arc::clone(&queues)));
        let run_recorder = RunRecorder::new(Arc::clone(&store));

        let schemas = Arc::new(SchemaRegistry::compile(&prompts::stage_schemas()).map_err(CliError::from_display)?);
        let cost_tracker = Some(Arc::new(CostTracker::new(CostCeilings {
            per_run_tokens: config.cost.max_tokens_per_run,
            per_workflow_tokens: None,
            per_workflow_cost: config.cost.max_usd_per_run.and_then(|ceiling| BigDecimal::try_from(ceiling).ok()),
            per_day_cost: None,
        })));

        let specialist_registry = Arc::new(build_specialist_registry(Arc::clone(&llm_provider)));

        let mut stage_workers: BTreeMap<StageName, Arc<dyn StageWorker>> = BTreeMap::new();
        stage_workers.insert(
            StageName::Feasibility,
            Arc::new(LlmStageWorker::new(
                StageName::Feasibility,
                ArtifactKind::FeasibilityV1,
                "v1",
                Arc::clone(&llm_provider),
                Arc::clone(&schemas),
                config.llm.allow_summary_fallback,
                cost_tracker.clone(),
                prompts::feasibility_prompt_builder(),
            )),
        );
        stage_workers.insert(
            StageName::Architecture,
            Arc::new(LlmStageWorker::new(
                StageName::Architecture,
                ArtifactKind::ArchitectureV1,
                "v1",
                Arc::clone(&llm_provider),
                Arc::clone(&schemas),
                config.llm.allow_summary_fallback,
                cost_tracker.clone(),
                prompts::architecture_prompt_builder(),
            )),
        );
        stage_workers.insert(
            StageName::Timeline,
            Arc::new(LlmStageWorker::new(
                StageName::Timeline,
                ArtifactKind::TimelineV1,
                "v1",
                Arc::clone(&llm_provider),
                Arc::clone(&schemas),
                config.llm.allow_summary_fallback,
                cost_tracker.clone(),
                prompts::timeline_prompt_builder(),
            )),
        );
        stage_workers.insert(
            StageName::Summary,
            Arc::new(LlmStageWorker::new(
                StageName::Summary,
                ArtifactKind::SummaryV1,
                "v1",
                Arc::clone(&llm_provider),
                Arc::clone(&schemas),
                config.llm.allow_summary_fallback,
                cost_tracker.clone(),
                prompts::summary_prompt_builder(),
            )),
        );
        stage_workers.insert(
            StageName::Patches,
            Arc::new(PatchesWorker::new(
                Arc::clone(&store),
                specialist_registry,
                changegate_worker::specialist::DispatchStrategy::Specialized,
                changegate_worker::specialist::ConflictResolution::FirstWins,
                config.policy.clone(),
            )),
        );
        stage_workers.insert(StageName::Policy, Arc::new(PolicyWorker::new(Arc::clone(&store), config.policy.clone())));
        stage_workers.insert(StageName::Sandbox, Arc::new(SandboxWorker));
        stage_workers.insert(StageName::Pr, Arc::new(PrWorker::new(Arc::clone(&store))));

        let mut job_workers: BTreeMap<String, Arc<dyn JobWorker>> = BTreeMap::new();
        job_workers.insert("ingest_context".to_owned(), Arc::new(IngestWorker::new(Arc::clone(&code_host))));
        job_workers.insert("evaluate_policy".to_owned(), Arc::new(EvaluatePolicyWorker::new(Arc::clone(&store), config.policy.clone())));
        job_workers.insert("apply_patches".to_owned(), Arc::new(ApplyPatchesWorker::new(Arc::clone(&store), Arc::clone(&code_host))));

        Ok((Self { store, queues, orchestrator, run_recorder, stage_workers, job_workers }, subscriptions))
    }
}

/// Registers one [`LlmSpecialistAgent`] per [`AgentType`], so the patches
/// stage always has a candidate for every task type rather than an empty
/// registry.
fn build_specialist_registry(provider: Arc<dyn LLMProvider>) -> SpecialistRegistry {
    let agent_types = [
        (AgentType::Backend, "backend-llm", "backend specialist"),
        (AgentType::Frontend, "frontend-llm", "frontend specialist"),
        (AgentType::Test, "test-llm", "test-authoring specialist"),
        (AgentType::Review, "review-llm", "review specialist"),
        (AgentType::Docs, "docs-llm", "documentation specialist"),
        (AgentType::Refactor, "refactor-llm", "refactor specialist"),
    ];
    let mut builder = SpecialistRegistryBuilder::new();
    for (agent_type, id, description) in agent_types {
        builder = builder.agent(Arc::new(LlmSpecialistAgent::new(id, agent_type, AgentCapabilities::default(), description, Arc::clone(&provider))));
    }
    builder.build()
}

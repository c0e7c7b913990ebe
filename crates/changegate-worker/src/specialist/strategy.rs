// crates/changegate-worker/src/specialist/strategy.rs
// ============================================================================
// Module: Dispatch Strategies
// Description: Candidate selection (confidence scoring) and the four
//              coordination strategies (parallel, sequential, priority,
//              specialized) over a registry of specialist agents.
// Purpose: Decide which agents run, in what order, and with what slice of
//          the target files, without the registry or the agents themselves
//          knowing which strategy is active.
// Dependencies: changegate-core, changegate-policy
// ============================================================================

//! ## Overview
//! [`run_dispatch`] is the single entry point: given a [`ProposalContext`]
//! and a [`DispatchStrategy`], it selects candidates, orders or partitions
//! them, and collects each agent's [`Proposal`]. Confidence scoring
//! ([`score_confidence`]) is shared by every strategy that needs to rank or
//! filter candidates.

use changegate_core::identifiers::AgentId;
use changegate_core::model::Patch;
use changegate_policy::config::glob_match;

use crate::specialist::registry::AgentType;
use crate::specialist::registry::SpecialistAgent;
use crate::specialist::registry::SpecialistRegistry;

/// A unit of work handed to one or more specialist agents.
#[derive(Debug, Clone)]
pub struct Task {
    /// The task type, used to match against an agent's declared type for
    /// the confidence bonus.
    pub task_type: AgentType,
    /// Human-readable description fed into agent prompts.
    pub description: String,
    /// File paths this task is expected to touch.
    pub target_files: Vec<String>,
}

/// The gathered context passed to every agent's `validate`/`propose` call.
#[derive(Debug, Clone)]
pub struct ProposalContext {
    /// The task being dispatched.
    pub task: Task,
    /// The dominant language detected in the target files, if any.
    pub detected_language: Option<String>,
    /// Patches already proposed by earlier agents in this dispatch
    /// (non-empty only for the `sequential` strategy).
    pub prior_patches: Vec<Patch>,
}

/// One agent's proposed patches for a dispatch.
#[derive(Debug, Clone)]
pub struct Proposal {
    /// The agent that produced these patches.
    pub agent_id: AgentId,
    /// The proposed patches.
    pub patches: Vec<Patch>,
}

/// The four supported coordination strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// Run every qualifying candidate concurrently on the full file set.
    Parallel,
    /// Run one after another, each seeing prior proposals as context.
    Sequential,
    /// Sort candidates by confidence descending; each only sees files not
    /// yet claimed by a higher-confidence agent.
    Priority,
    /// Partition target files by type and dispatch each partition to the
    /// matching agent type.
    Specialized,
}

/// Multiplies `base_confidence` by the task-type, language, and file-glob
/// bonuses, capped at `1.0`.
#[must_use]
pub fn score_confidence(agent: &dyn SpecialistAgent, ctx: &ProposalContext, base_confidence: f64) -> f64 {
    let mut score = base_confidence;
    if agent.agent_type() == ctx.task.task_type {
        score *= 1.2;
    }
    let capabilities = agent.capabilities();
    if let Some(language) = &ctx.detected_language
        && capabilities.languages.iter().any(|supported| supported == language)
    {
        score *= 1.1;
    }
    if ctx.task.target_files.iter().any(|file| capabilities.file_globs.iter().any(|glob| glob_match(glob, file))) {
        score *= 1.1;
    }
    score.min(1.0)
}

/// Runs `strategy` against every agent registered in `registry`, returning
/// one [`Proposal`] per agent that validated successfully and produced
/// patches.
///
/// Agents whose `validate` call errors are silently excluded (they
/// self-reported as unable to handle the context); agents whose `propose`
/// call errors after validating are also excluded, since a partial
/// proposal is not safe to merge.
pub async fn run_dispatch(registry: &SpecialistRegistry, ctx: &ProposalContext, strategy: DispatchStrategy) -> Vec<Proposal> {
    match strategy {
        DispatchStrategy::Parallel => run_parallel(registry, ctx).await,
        DispatchStrategy::Sequential => run_sequential(registry, ctx).await,
        DispatchStrategy::Priority => run_priority(registry, ctx).await,
        DispatchStrategy::Specialized => run_specialized(registry, ctx).await,
    }
}

/// Ranks every registered agent by [`score_confidence`], descending,
/// dropping any that failed to validate.
async fn ranked_candidates(registry: &SpecialistRegistry, ctx: &ProposalContext) -> Vec<(std::sync::Arc<dyn SpecialistAgent>, f64)> {
    let mut ranked = Vec::new();
    for agent in registry.all() {
        if let Ok(base) = agent.validate(ctx).await {
            let score = score_confidence(agent.as_ref(), ctx, base);
            ranked.push((agent, score));
        }
    }
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

/// Runs every validating candidate concurrently on the full file set, each
/// on its own spawned task.
async fn run_parallel(registry: &SpecialistRegistry, ctx: &ProposalContext) -> Vec<Proposal> {
    let candidates = ranked_candidates(registry, ctx).await;
    let handles: Vec<_> = candidates
        .into_iter()
        .map(|(agent, _score)| {
            let task_ctx = ctx.clone();
            tokio::spawn(async move { agent.propose(&task_ctx).await.ok().map(|proposal| Proposal { agent_id: agent.id().clone(), patches: proposal.patches }) })
        })
        .collect();

    let mut proposals = Vec::new();
    for handle in handles {
        if let Ok(Some(proposal)) = handle.await {
            proposals.push(proposal);
        }
    }
    proposals
}

/// Runs one agent after another, each seeing prior proposals as context.
async fn run_sequential(registry: &SpecialistRegistry, ctx: &ProposalContext) -> Vec<Proposal> {
    let candidates = ranked_candidates(registry, ctx).await;
    let mut proposals = Vec::new();
    let mut running_ctx = ctx.clone();
    for (agent, _score) in candidates {
        if let Ok(proposal) = agent.propose(&running_ctx).await {
            running_ctx.prior_patches.extend(proposal.patches.clone());
            proposals.push(Proposal { agent_id: agent.id().clone(), patches: proposal.patches });
        }
    }
    proposals
}

/// Sorts candidates by confidence descending; each only sees files not yet
/// claimed by a higher-confidence agent.
async fn run_priority(registry: &SpecialistRegistry, ctx: &ProposalContext) -> Vec<Proposal> {
    let candidates = ranked_candidates(registry, ctx).await;
    let mut claimed: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut proposals = Vec::new();
    for (agent, _score) in candidates {
        let remaining_files: Vec<String> = ctx.task.target_files.iter().filter(|file| !claimed.contains(*file)).cloned().collect();
        if remaining_files.is_empty() {
            break;
        }
        let mut scoped_ctx = ctx.clone();
        scoped_ctx.task.target_files = remaining_files;
        if let Ok(proposal) = agent.propose(&scoped_ctx).await {
            for patch in &proposal.patches {
                for file in &patch.files {
                    claimed.insert(file.path.clone());
                }
            }
            proposals.push(Proposal { agent_id: agent.id().clone(), patches: proposal.patches });
        }
    }
    proposals
}

/// Partitions target files by type (frontend/backend/test/docs/other) and
/// dispatches each partition to the highest-priority agent of the matching
/// type.
async fn run_specialized(registry: &SpecialistRegistry, ctx: &ProposalContext) -> Vec<Proposal> {
    let mut proposals = Vec::new();
    for agent_type in [AgentType::Frontend, AgentType::Backend, AgentType::Test, AgentType::Docs] {
        let Some(agent) = registry.by_type(agent_type).first() else { continue };
        let partition: Vec<String> = ctx.task.target_files.iter().filter(|file| file_matches_type(file, agent_type)).cloned().collect();
        if partition.is_empty() {
            continue;
        }
        let mut scoped_ctx = ctx.clone();
        scoped_ctx.task.target_files = partition;
        if let Ok(proposal) = agent.propose(&scoped_ctx).await {
            proposals.push(Proposal { agent_id: agent.id().clone(), patches: proposal.patches });
        }
    }
    proposals
}

/// Classifies a file path into one of the partition buckets used by the
/// `specialized` strategy.
fn file_matches_type(path: &str, agent_type: AgentType) -> bool {
    match agent_type {
        AgentType::Frontend => path.contains("/frontend/") || path.ends_with(".tsx") || path.ends_with(".jsx"),
        AgentType::Backend => path.contains("/backend/") || path.ends_with(".rs") || path.ends_with(".go"),
        AgentType::Test => path.contains("/tests/") || path.contains("_test.") || path.contains(".test."),
        AgentType::Docs => path.ends_with(".md") || path.contains("/docs/"),
        AgentType::Review | AgentType::Refactor => false,
    }
}

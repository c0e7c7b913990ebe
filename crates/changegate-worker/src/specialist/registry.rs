// crates/changegate-worker/src/specialist/registry.rs
// ============================================================================
// Module: Specialist Agent Registry
// Description: The `SpecialistAgent` trait and the builder that maps agent
//              ids and agent types to registered agents.
// Purpose: Keep the six agent kinds interchangeable behind one trait rather
//          than a class hierarchy, mirroring the queue broker's
//          name-to-handler registry shape.
// Dependencies: changegate-core
// ============================================================================

//! ## Overview
//! [`SpecialistAgent`] is the one seam every specialist implements
//! (backend, frontend, test, review, docs, refactor); nothing in the
//! dispatch strategies or conflict/merge logic downstream cares which kind
//! it is talking to. [`SpecialistRegistryBuilder`] registers agents by id
//! and groups them by [`AgentType`], sorted by declared priority, the same
//! registration shape `changegate-broker` uses to map queue names to
//! channels.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use changegate_core::identifiers::AgentId;

use crate::specialist::strategy::ProposalContext;
use crate::specialist::strategy::Proposal;

/// The six interchangeable specialist kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AgentType {
    /// Backend/server-side code changes.
    Backend,
    /// Frontend/UI code changes.
    Frontend,
    /// Test additions or updates.
    Test,
    /// Code review / quality commentary, not itself a patch producer.
    Review,
    /// Documentation changes.
    Docs,
    /// Structural refactors with no behavior change.
    Refactor,
}

/// What an agent declares about itself, used by strategy selection.
#[derive(Debug, Clone, Default)]
pub struct AgentCapabilities {
    /// Languages the agent can act on (e.g. `"rust"`, `"typescript"`).
    pub languages: Vec<String>,
    /// File glob patterns the agent is well-suited to touch.
    pub file_globs: Vec<String>,
}

/// One specialist "agent": not a class hierarchy, an interchangeable
/// strategy behind this trait.
#[async_trait]
pub trait SpecialistAgent: Send + Sync {
    /// Stable identifier for this registered agent.
    fn id(&self) -> &AgentId;

    /// The kind of specialist this agent is.
    fn agent_type(&self) -> AgentType;

    /// Declared capabilities, consulted by confidence scoring.
    fn capabilities(&self) -> &AgentCapabilities;

    /// Human-readable description, surfaced in diagnostics.
    fn describe(&self) -> &str;

    /// Self-reports a confidence score in `[0.0, 1.0]` for handling `ctx`,
    /// or an error if the agent cannot validate the context at all.
    ///
    /// # Errors
    ///
    /// Returns a message explaining why the agent cannot handle `ctx`.
    async fn validate(&self, ctx: &ProposalContext) -> Result<f64, String>;

    /// Produces this agent's proposed patches for `ctx`.
    ///
    /// # Errors
    ///
    /// Returns a message explaining why no proposal could be produced.
    async fn propose(&self, ctx: &ProposalContext) -> Result<Proposal, String>;
}

/// Registered agents, addressable by id or grouped by declared priority
/// within a type.
pub struct SpecialistRegistry {
    /// All registered agents, keyed by id.
    by_id: BTreeMap<String, Arc<dyn SpecialistAgent>>,
    /// Agent ids grouped by type, sorted by declared priority (highest
    /// first registered wins ties, matching registration order).
    by_type: BTreeMap<AgentType, Vec<Arc<dyn SpecialistAgent>>>,
}

impl SpecialistRegistry {
    /// Looks up an agent by id.
    #[must_use]
    pub fn get(&self, id: &AgentId) -> Option<&Arc<dyn SpecialistAgent>> {
        self.by_id.get(id.as_str())
    }

    /// Returns every registered agent, in registration order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn SpecialistAgent>> {
        self.by_id.values().cloned().collect()
    }

    /// Returns the agents registered for `agent_type`, in declared-priority
    /// order.
    #[must_use]
    pub fn by_type(&self, agent_type: AgentType) -> &[Arc<dyn SpecialistAgent>] {
        self.by_type.get(&agent_type).map_or(&[], Vec::as_slice)
    }
}

/// Builds a [`SpecialistRegistry`] by registering agents in priority order.
#[derive(Default)]
pub struct SpecialistRegistryBuilder {
    /// Agents registered so far, in registration order.
    agents: Vec<Arc<dyn SpecialistAgent>>,
}

impl SpecialistRegistryBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `agent`. Agents of the same [`AgentType`] are grouped in
    /// the order they are registered here, which is the declared priority
    /// order used by the `priority` dispatch strategy.
    #[must_use]
    pub fn agent(mut self, agent: Arc<dyn SpecialistAgent>) -> Self {
        self.agents.push(agent);
        self
    }

    /// Builds the registry.
    #[must_use]
    pub fn build(self) -> SpecialistRegistry {
        let mut by_id = BTreeMap::new();
        let mut by_type: BTreeMap<AgentType, Vec<Arc<dyn SpecialistAgent>>> = BTreeMap::new();
        for agent in self.agents {
            by_id.insert(agent.id().as_str().to_owned(), Arc::clone(&agent));
            by_type.entry(agent.agent_type()).or_default().push(agent);
        }
        SpecialistRegistry { by_id, by_type }
    }
}

// crates/changegate-worker/src/cost_tracker.rs
// ============================================================================
// Module: Cost Tracker
// Description: Advisory token/cost ceilings an LLM-calling stage can consult
//              before spending more budget.
// Purpose: Give callers a single place to ask "can I afford this call"
//          without the core enforcing any global policy itself.
// Dependencies: bigdecimal, changegate-core
// ============================================================================

//! ## Overview
//! [`CostTracker`] does not enforce anything on its own; a caller consults
//! [`CostTracker::check_budget`] before each LLM call and decides what to do
//! with a [`BudgetDecision::Deny`]. Costs are tracked in
//! [`bigdecimal::BigDecimal`] rather than `f64` so that summing many small
//! per-call costs across a long-running workflow never drifts from the
//! number an operator would compute by hand.

use std::collections::HashMap;
use std::sync::Mutex;

use bigdecimal::BigDecimal;
use changegate_core::identifiers::WorkflowId;

/// Returns a zero-valued [`BigDecimal`] without relying on a `Zero` trait
/// import.
fn zero() -> BigDecimal {
    BigDecimal::from(0)
}

/// The four independent ceilings a caller may configure.
#[derive(Debug, Clone)]
pub struct CostCeilings {
    /// Maximum tokens (input + output) for a single run.
    pub per_run_tokens: Option<u64>,
    /// Maximum cumulative tokens for a single workflow.
    pub per_workflow_tokens: Option<u64>,
    /// Maximum cumulative cost for a single workflow.
    pub per_workflow_cost: Option<BigDecimal>,
    /// Maximum cumulative cost across all workflows for the current day.
    pub per_day_cost: Option<BigDecimal>,
}

/// The outcome of a budget check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetDecision {
    /// The additional spend is within every configured ceiling.
    Allow,
    /// The additional spend would exceed `ceiling_name`.
    Deny {
        /// Which ceiling would be exceeded.
        ceiling_name: &'static str,
    },
}

/// Cumulative spend recorded per workflow and per day.
#[derive(Default)]
struct Totals {
    /// Tokens spent per workflow so far.
    workflow_tokens: HashMap<String, u64>,
    /// Cost spent per workflow so far.
    workflow_cost: HashMap<String, BigDecimal>,
    /// Cost spent today, keyed by a caller-supplied day label (e.g. an RFC
    /// 3339 date) so the tracker never reads wall-clock time itself.
    day_cost: HashMap<String, BigDecimal>,
}

/// Tracks cumulative LLM spend and answers whether a further call fits
/// within configured ceilings.
pub struct CostTracker {
    /// Configured ceilings.
    ceilings: CostCeilings,
    /// Mutable cumulative totals, behind a plain mutex: calls are infrequent
    /// relative to LLM round-trip latency.
    totals: Mutex<Totals>,
}

impl CostTracker {
    /// Creates a tracker with the given ceilings. Any `None` ceiling is
    /// never enforced.
    #[must_use]
    pub fn new(ceilings: CostCeilings) -> Self {
        Self { ceilings, totals: Mutex::new(Totals::default()) }
    }

    /// Checks whether spending `additional_tokens` more tokens (and,
    /// optionally, `additional_cost` more) for `workflow_id` stays within
    /// every configured ceiling. Does not record the spend; call
    /// [`Self::record_spend`] once the call actually completes.
    #[must_use]
    pub fn check_budget(&self, workflow_id: &WorkflowId, additional_tokens: u64) -> BudgetDecision {
        if let Some(limit) = self.ceilings.per_run_tokens
            && additional_tokens > limit
        {
            return BudgetDecision::Deny { ceiling_name: "per_run_tokens" };
        }
        let Ok(totals) = self.totals.lock() else {
            return BudgetDecision::Allow;
        };
        if let Some(limit) = self.ceilings.per_workflow_tokens {
            let spent = totals.workflow_tokens.get(workflow_id.as_str()).copied().unwrap_or(0);
            if spent.saturating_add(additional_tokens) > limit {
                return BudgetDecision::Deny { ceiling_name: "per_workflow_tokens" };
            }
        }
        BudgetDecision::Allow
    }

    /// Checks an additional cost spend against the per-workflow and per-day
    /// cost ceilings, given the caller's day label.
    #[must_use]
    pub fn check_cost_budget(&self, workflow_id: &WorkflowId, day_label: &str, additional_cost: &BigDecimal) -> BudgetDecision {
        let Ok(totals) = self.totals.lock() else {
            return BudgetDecision::Allow;
        };
        if let Some(limit) = &self.ceilings.per_workflow_cost {
            let spent = totals.workflow_cost.get(workflow_id.as_str()).cloned().unwrap_or_else(zero);
            if &(spent + additional_cost) > limit {
                return BudgetDecision::Deny { ceiling_name: "per_workflow_cost" };
            }
        }
        if let Some(limit) = &self.ceilings.per_day_cost {
            let spent = totals.day_cost.get(day_label).cloned().unwrap_or_else(zero);
            if &(spent + additional_cost) > limit {
                return BudgetDecision::Deny { ceiling_name: "per_day_cost" };
            }
        }
        BudgetDecision::Allow
    }

    /// Records actual spend after a call completes, so subsequent budget
    /// checks see it.
    pub fn record_spend(&self, workflow_id: &WorkflowId, day_label: &str, tokens: u64, cost: &BigDecimal) {
        let Ok(mut totals) = self.totals.lock() else { return };
        *totals.workflow_tokens.entry(workflow_id.as_str().to_owned()).or_insert(0) += tokens;
        *totals.workflow_cost.entry(workflow_id.as_str().to_owned()).or_insert_with(zero) += cost.clone();
        *totals.day_cost.entry(day_label.to_owned()).or_insert_with(zero) += cost.clone();
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn workflow(id: &str) -> WorkflowId {
        WorkflowId::new(id)
    }

    #[test]
    fn allows_spend_within_ceilings() {
        let tracker = CostTracker::new(CostCeilings {
            per_run_tokens: Some(1_000),
            per_workflow_tokens: Some(5_000),
            per_workflow_cost: None,
            per_day_cost: None,
        });
        assert_eq!(tracker.check_budget(&workflow("w1"), 500), BudgetDecision::Allow);
    }

    #[test]
    fn denies_spend_over_per_run_ceiling() {
        let tracker = CostTracker::new(CostCeilings {
            per_run_tokens: Some(1_000),
            per_workflow_tokens: None,
            per_workflow_cost: None,
            per_day_cost: None,
        });
        assert_eq!(
            tracker.check_budget(&workflow("w1"), 1_001),
            BudgetDecision::Deny { ceiling_name: "per_run_tokens" }
        );
    }

    #[test]
    fn denies_spend_over_cumulative_workflow_ceiling() {
        let tracker = CostTracker::new(CostCeilings {
            per_run_tokens: None,
            per_workflow_tokens: Some(1_000),
            per_workflow_cost: None,
            per_day_cost: None,
        });
        tracker.record_spend(&workflow("w1"), "2026-07-26", 900, &zero());
        assert_eq!(
            tracker.check_budget(&workflow("w1"), 200),
            BudgetDecision::Deny { ceiling_name: "per_workflow_tokens" }
        );
    }

    #[test]
    fn denies_cost_over_per_day_ceiling() {
        let tracker = CostTracker::new(CostCeilings {
            per_run_tokens: None,
            per_workflow_tokens: None,
            per_workflow_cost: None,
            per_day_cost: Some(BigDecimal::from_str("10.00").expect("parses")),
        });
        let cost = BigDecimal::from_str("9.50").expect("parses");
        tracker.record_spend(&workflow("w1"), "2026-07-26", 0, &cost);
        let additional = BigDecimal::from_str("1.00").expect("parses");
        assert_eq!(
            tracker.check_cost_budget(&workflow("w1"), "2026-07-26", &additional),
            BudgetDecision::Deny { ceiling_name: "per_day_cost" }
        );
    }
}

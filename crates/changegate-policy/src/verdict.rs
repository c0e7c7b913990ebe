// crates/changegate-policy/src/verdict.rs
// ============================================================================
// Module: Verdict Lattice
// Description: The three-valued outcome domain for a Gate2 evaluation.
// Purpose: Express "BLOCK dominates WARN dominates nothing" as an explicit,
//          ordered fold rather than an ad hoc chain of `if`s.
// Dependencies: changegate-core (Severity)
// ============================================================================

//! ## Overview
//! Adding a new rule to Gate2 should only ever require emitting a
//! [`changegate_core::model::Severity`]-tagged violation; the combination
//! logic that turns a bag of violations into one [`Verdict`] never needs to
//! change. That's the whole point of expressing the fold as `Ord::max` over
//! a closed three-value domain instead of nested conditionals.

use changegate_core::model::Severity;

/// The outcome of a Gate2 evaluation, ordered `Fail > Warn > Pass`.
///
/// # Invariants
/// - Declaration order is significant: the derived [`Ord`] implementation is
///   what makes [`Verdict::combine`] a plain `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Verdict {
    /// No blocking or warning violations.
    Pass,
    /// At least one warning, no blocking violations.
    Warn,
    /// At least one blocking violation.
    Fail,
}

impl Verdict {
    /// Combines two verdicts, returning the more severe of the two.
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        self.max(other)
    }

    /// Folds a verdict over every violation's severity, starting from the
    /// "no violation" identity ([`Verdict::Pass`]).
    #[must_use]
    pub fn fold_severities<I: IntoIterator<Item = Severity>>(severities: I) -> Self {
        severities.into_iter().map(Self::from).fold(Self::Pass, Self::combine)
    }
}

impl From<Severity> for Verdict {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Warn => Self::Warn,
            Severity::Block => Self::Fail,
        }
    }
}

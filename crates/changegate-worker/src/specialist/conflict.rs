// crates/changegate-worker/src/specialist/conflict.rs
// ============================================================================
// Module: Patch Conflict Detection
// Description: Detects files touched by more than one agent's proposal and
//              classifies the conflict.
// Purpose: Give the merge routine a resolvable description of every
//          overlap instead of silently picking a winner.
// Dependencies: changegate-core
// ============================================================================

//! ## Overview
//! [`detect_conflicts`] groups proposed patches by file path; any file
//! touched by more than one agent becomes a [`PatchConflict`] whose `kind`
//! favors `Deletion` over `Modification` over `Overlap`.

use std::collections::BTreeMap;

use changegate_core::identifiers::AgentId;
use changegate_core::model::FileAction;

use crate::specialist::strategy::Proposal;

/// The kind of overlap detected on a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// At least one contributing agent deletes the file.
    Deletion,
    /// No deletion, but at least one agent modifies the file.
    Modification,
    /// Neither of the above (e.g. two creates of the same new path).
    Overlap,
}

/// How a conflict is resolved during merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictResolution {
    /// The first patch set in iteration order keeps the file; later
    /// patches drop it. Candidates are ranked by confidence before merge,
    /// so this is also "highest selection confidence wins" — the two
    /// names describe the same behavior.
    #[default]
    FirstWins,
    /// The last patch set in iteration order keeps the file.
    LastWins,
    /// Neither side is dropped automatically; a human resolves it.
    Manual,
}

/// A file touched by more than one agent's proposal.
#[derive(Debug, Clone)]
pub struct PatchConflict {
    /// The contended file path.
    pub file: String,
    /// The agents that touched this file, in proposal order.
    pub agents: Vec<AgentId>,
    /// The classified conflict kind.
    pub kind: ConflictKind,
    /// The resolution applied during merge.
    pub resolution: ConflictResolution,
}

/// Detects every file touched by more than one proposal, in `proposals`
/// order (expected to already be ranked by confidence, highest first).
#[must_use]
pub fn detect_conflicts(proposals: &[Proposal], resolution: ConflictResolution) -> Vec<PatchConflict> {
    let mut touches: BTreeMap<String, Vec<(AgentId, FileAction)>> = BTreeMap::new();
    for proposal in proposals {
        for patch in &proposal.patches {
            for file in &patch.files {
                touches.entry(file.path.clone()).or_default().push((proposal.agent_id.clone(), file.action));
            }
        }
    }

    touches
        .into_iter()
        .filter(|(_, touched_by)| touched_by.len() > 1)
        .map(|(file, touched_by)| {
            let kind = classify(&touched_by);
            let agents = touched_by.into_iter().map(|(agent_id, _)| agent_id).collect();
            PatchConflict { file, agents, kind, resolution }
        })
        .collect()
}

/// Classifies a conflict: deletion beats modification beats plain overlap.
fn classify(touched_by: &[(AgentId, FileAction)]) -> ConflictKind {
    if touched_by.iter().any(|(_, action)| *action == FileAction::Delete) {
        ConflictKind::Deletion
    } else if touched_by.iter().any(|(_, action)| *action == FileAction::Modify) {
        ConflictKind::Modification
    } else {
        ConflictKind::Overlap
    }
}

/// Returns the set of `(agent_id, file)` pairs that [`crate::specialist::merge::merge_proposals`]
/// should drop, given `conflicts` resolved under each conflict's own
/// [`ConflictResolution`].
#[must_use]
pub fn files_to_drop(conflicts: &[PatchConflict]) -> Vec<(AgentId, String)> {
    let mut drop_list = Vec::new();
    for conflict in conflicts {
        match conflict.resolution {
            ConflictResolution::FirstWins => {
                for agent in conflict.agents.iter().skip(1) {
                    drop_list.push((agent.clone(), conflict.file.clone()));
                }
            }
            ConflictResolution::LastWins => {
                for agent in conflict.agents.iter().rev().skip(1) {
                    drop_list.push((agent.clone(), conflict.file.clone()));
                }
            }
            ConflictResolution::Manual => {}
        }
    }
    drop_list
}

#[cfg(test)]
mod tests {
    use changegate_core::model::Patch;
    use changegate_core::model::PatchFileChange;

    use super::*;

    fn touch(path: &str, action: FileAction) -> PatchFileChange {
        PatchFileChange { path: path.to_owned(), action, additions: 1, deletions: 0 }
    }

    fn patch(files: Vec<PatchFileChange>) -> Patch {
        Patch {
            id: changegate_core::identifiers::PatchId::new("p1"),
            task_id: None,
            proposed_by: None,
            title: "t".to_owned(),
            summary: "s".to_owned(),
            diff: String::new(),
            files,
            adds_tests: false,
            risk_level: changegate_core::model::RiskLevel::Low,
            proposed_commands: Vec::new(),
        }
    }

    #[test]
    fn no_overlap_yields_no_conflicts() {
        let proposals = vec![
            Proposal { agent_id: AgentId::new("a1"), patches: vec![patch(vec![touch("a.rs", FileAction::Modify)])] },
            Proposal { agent_id: AgentId::new("a2"), patches: vec![patch(vec![touch("b.rs", FileAction::Modify)])] },
        ];
        assert!(detect_conflicts(&proposals, ConflictResolution::FirstWins).is_empty());
    }

    #[test]
    fn overlapping_file_is_a_conflict_favoring_deletion() {
        let proposals = vec![
            Proposal { agent_id: AgentId::new("a1"), patches: vec![patch(vec![touch("a.rs", FileAction::Modify)])] },
            Proposal { agent_id: AgentId::new("a2"), patches: vec![patch(vec![touch("a.rs", FileAction::Delete)])] },
        ];
        let conflicts = detect_conflicts(&proposals, ConflictResolution::FirstWins);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::Deletion);
    }

    #[test]
    fn first_wins_drops_every_agent_but_the_first() {
        let conflict =
            PatchConflict { file: "a.rs".to_owned(), agents: vec![AgentId::new("a1"), AgentId::new("a2")], kind: ConflictKind::Modification, resolution: ConflictResolution::FirstWins };
        let drops = files_to_drop(&[conflict]);
        assert_eq!(drops, vec![(AgentId::new("a2"), "a.rs".to_owned())]);
    }
}

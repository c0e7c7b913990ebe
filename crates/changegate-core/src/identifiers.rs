// crates/changegate-core/src/identifiers.rs
// ============================================================================
// Module: Opaque Identifiers
// Description: Newtype identifiers for every entity referenced across the core.
// Purpose: Make "which id am I holding" a compile-time fact instead of a
//          runtime convention over bare strings.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Every entity reference in the data model (`Workflow`, `Artifact`, `PatchSet`,
//! `Patch`, `Approval`, `PolicyViolation`, `WorkflowEvent`, `WorkflowRun`) is
//! addressed through one of the newtypes in this module rather than a bare
//! `String`. Each type round-trips through `serde` as its inner representation
//! via `#[serde(transparent)]`.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Defines an opaque, string-backed identifier type.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an identifier from any string-like value.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier's string representation.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(
    /// Identifies a `Workflow` aggregate.
    ///
    /// # Invariants
    /// - Stable for the lifetime of the workflow; never reused.
    WorkflowId
);

string_id!(
    /// Identifies an immutable `Artifact` row.
    ArtifactId
);

string_id!(
    /// Identifies a `PatchSet` (the artifact of the patches stage).
    PatchSetId
);

string_id!(
    /// Identifies a single `Patch` within a `PatchSet`.
    PatchId
);

string_id!(
    /// Identifies a recorded `Approval`.
    ApprovalId
);

string_id!(
    /// Identifies a `PolicyViolation` row.
    ViolationId
);

string_id!(
    /// Identifies an append-only `WorkflowEvent`.
    EventId
);

string_id!(
    /// Identifies one `WorkflowRun` (a single stage execution attempt).
    RunId
);

string_id!(
    /// Identifies a named job queue (e.g. the orchestrator's `"workflow"` queue,
    /// or a stage-specific worker queue).
    QueueName
);

string_id!(
    /// Names a job published onto a queue (e.g. `"ingest_context"`,
    /// `"evaluate_policy"`, `"apply_patches"`).
    JobName
);

string_id!(
    /// Identifies a specialist agent registered with the patches-stage registry.
    AgentId
);

string_id!(
    /// Identifies a task handed to one or more specialist agents.
    TaskId
);

/// The named phases of the stage pipeline.
///
/// # Invariants
/// - Pipeline order is `Ingest < Feasibility < Architecture < Timeline <
///   Summary < Patches < Policy < Sandbox < Pr < Done`; `next()` follows this
///   order and returns `None` after `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Ingests the feature request into repo context.
    Ingest,
    /// Produces the feasibility artifact.
    Feasibility,
    /// Produces the architecture artifact.
    Architecture,
    /// Produces the timeline artifact.
    Timeline,
    /// Produces the summary artifact.
    Summary,
    /// Produces the patches artifact (PatchSet).
    Patches,
    /// Evaluates the patches artifact against Gate2.
    Policy,
    /// Placeholder gated stage between policy and pr.
    Sandbox,
    /// Opens and tracks the pull request.
    Pr,
    /// Terminal pipeline marker.
    Done,
}

impl StageName {
    /// Returns the stable wire name for the stage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Feasibility => "feasibility",
            Self::Architecture => "architecture",
            Self::Timeline => "timeline",
            Self::Summary => "summary",
            Self::Patches => "patches",
            Self::Policy => "policy",
            Self::Sandbox => "sandbox",
            Self::Pr => "pr",
            Self::Done => "done",
        }
    }

    /// Returns the next stage in pipeline order, or `None` after `Done`.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Ingest => Some(Self::Feasibility),
            Self::Feasibility => Some(Self::Architecture),
            Self::Architecture => Some(Self::Timeline),
            Self::Timeline => Some(Self::Summary),
            Self::Summary => Some(Self::Patches),
            Self::Patches => Some(Self::Policy),
            Self::Policy => Some(Self::Sandbox),
            Self::Sandbox => Some(Self::Pr),
            Self::Pr => Some(Self::Done),
            Self::Done => None,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

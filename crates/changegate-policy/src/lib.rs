// crates/changegate-policy/src/lib.rs
// ============================================================================
// Module: Gate2 Policy Engine
// Description: Diff parsing, rule evaluation, and verdict combination for
//              the automated policy barrier on generated diffs.
// Purpose: Give every PatchSet a reproducible pass/warn/fail verdict before
//          a human ever sees it.
// Dependencies: changegate-core, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! `evaluate_gate2` is pure: the same diff, config, and risk levels always
//! produce the same [`Gate2Result`]. An oversized or structurally
//! pathological diff never panics or silently truncates — it is reported as
//! a single `diff_too_large` BLOCK violation, so the verdict is still a
//! well-formed `Gate2Result` a caller can persist and show a human.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(missing_docs_in_private_items)]

pub mod config;
pub mod diff;
pub mod secrets;
pub mod verdict;

use changegate_core::model::RiskLevel;
use changegate_core::model::Severity;
use changegate_core::time::Timestamp;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::config::Gate2Config;
use crate::config::matches_any_keyword;
use crate::config::matches_any_pattern;
use crate::diff::AddedLine;
use crate::diff::DiffError;
use crate::diff::FileDiff;
use crate::diff::parse_diff;
use crate::secrets::is_placeholder;
use crate::secrets::scan_line;
use crate::verdict::Verdict;

/// The number of leading characters of a secret match kept as evidence; the
/// remainder is replaced with an ellipsis.
const EVIDENCE_TRUNCATE_CHARS: usize = 50;

// ============================================================================
// SECTION: Violations and result
// ============================================================================

/// A single policy finding, prior to being associated with a persisted
/// PatchSet id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// The rule that produced this finding (e.g. `"frozen_file"`).
    pub rule: String,
    /// Severity.
    pub severity: Severity,
    /// The file the finding concerns.
    pub file: String,
    /// The line the finding concerns, if known.
    pub line: Option<u32>,
    /// Human-readable message.
    pub message: String,
    /// Truncated evidence substring.
    pub evidence: String,
}

/// A snapshot of the inputs an evaluation ran against, for audit purposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate2Evidence {
    /// The resulting verdict, duplicated here for convenience.
    pub policy_result: Verdict,
    /// When the evaluation ran.
    pub evaluated_at: Timestamp,
    /// The configuration the evaluation ran against.
    pub config_snapshot: Value,
}

/// The result of one Gate2 evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate2Result {
    /// The overall verdict.
    pub verdict: Verdict,
    /// Every violation found, in rule-application order.
    pub violations: Vec<Violation>,
    /// Count of BLOCK violations.
    pub blocking_count: u32,
    /// Count of WARN violations.
    pub warning_count: u32,
    /// A short human-readable summary.
    pub summary: String,
    /// Audit evidence for this evaluation.
    pub evidence: Gate2Evidence,
}

impl Serialize for Verdict {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let label = match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
        };
        serializer.serialize_str(label)
    }
}

impl<'de> Deserialize<'de> for Verdict {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        match label.as_str() {
            "PASS" => Ok(Self::Pass),
            "WARN" => Ok(Self::Warn),
            "FAIL" => Ok(Self::Fail),
            other => Err(serde::de::Error::unknown_variant(other, &["PASS", "WARN", "FAIL"])),
        }
    }
}

// ============================================================================
// SECTION: Evaluation
// ============================================================================

/// Evaluates a combined unified diff for a PatchSet against `config`.
///
/// `patch_risk_levels` carries the self-reported risk level of every patch
/// contributing to `diff`, since a bare diff carries no risk metadata; the
/// high-risk WARN rule folds over these directly.
///
/// Never panics and never returns an error: a diff that fails to parse (too
/// large, or a single file with too many hunks) is reported as a
/// `diff_too_large` BLOCK violation rather than propagated.
#[must_use]
pub fn evaluate_gate2(
    diff: &str,
    config: &Gate2Config,
    patch_risk_levels: &[RiskLevel],
    evaluated_at: Timestamp,
) -> Gate2Result {
    let mut violations = Vec::new();

    match parse_diff(diff) {
        Ok(parsed) => {
            apply_path_rules(&parsed.files, config, &mut violations);
            apply_secret_rules(&parsed.added_lines, config, &mut violations);
        }
        Err(error) => violations.push(diff_error_violation(&error)),
    }

    apply_warn_rules(diff, patch_risk_levels, config, &mut violations);

    finish(violations, config, evaluated_at)
}

/// Turns a [`DiffError`] into the single BLOCK violation a caller should
/// see, instead of propagating the error.
fn diff_error_violation(error: &DiffError) -> Violation {
    let (file, message) = match error {
        DiffError::TooLarge { .. } => (String::new(), error.to_string()),
        DiffError::TooManyHunks { file, .. } => (file.clone(), error.to_string()),
    };
    Violation {
        rule: "diff_too_large".to_owned(),
        severity: Severity::Block,
        file,
        line: None,
        message,
        evidence: String::new(),
    }
}

/// Applies the frozen-file, deny-glob/keyword, and dependency-change rules
/// to every touched file.
fn apply_path_rules(files: &[FileDiff], config: &Gate2Config, violations: &mut Vec<Violation>) {
    for file in files {
        for path in touched_paths(file) {
            if matches_any_pattern(&config.frozen_files, path) {
                violations.push(Violation {
                    rule: "frozen_file".to_owned(),
                    severity: Severity::Block,
                    file: path.to_owned(),
                    line: None,
                    message: format!("{path} is a frozen file and must not be modified"),
                    evidence: String::new(),
                });
            }
            let denied_by_glob = matches_any_pattern(&config.deny_globs, path);
            let denied_by_keyword = matches_any_keyword(&config.deny_keywords, path);
            if denied_by_glob || denied_by_keyword {
                violations.push(Violation {
                    rule: "deny_glob".to_owned(),
                    severity: Severity::Block,
                    file: path.to_owned(),
                    line: None,
                    message: format!("{path} matches a denied path pattern"),
                    evidence: String::new(),
                });
            }
            if matches_any_pattern(&config.dependency_files, path) {
                let severity = if config.allow_dependency_changes { Severity::Warn } else { Severity::Block };
                violations.push(Violation {
                    rule: "dependency_change".to_owned(),
                    severity,
                    file: path.to_owned(),
                    line: None,
                    message: format!("{path} is a dependency manifest or lockfile"),
                    evidence: String::new(),
                });
            }
        }
    }
}

/// Returns every path a [`FileDiff`] touches: its current path, plus its old
/// path when it is a rename.
fn touched_paths(file: &FileDiff) -> Vec<&str> {
    let mut paths = vec![file.path.as_str()];
    if let Some(old_path) = &file.old_path {
        paths.push(old_path.as_str());
    }
    paths
}

/// Applies every secret-pattern scanner to every added line, suppressing
/// matches that look like placeholders.
fn apply_secret_rules(added_lines: &[AddedLine], config: &Gate2Config, violations: &mut Vec<Violation>) {
    for line in added_lines {
        for found in scan_line(&line.content) {
            if is_placeholder(&found.value) || matches_configured_placeholder(config, &found.value) {
                continue;
            }
            violations.push(Violation {
                rule: "secret_detected".to_owned(),
                severity: Severity::Block,
                file: line.file.clone(),
                line: None,
                message: format!("possible {} detected in added line", found.rule_type),
                evidence: truncate_evidence(&found.value),
            });
        }
    }
}

/// Checks `value` against the configured placeholder prefixes beyond the
/// built-in defaults in [`secrets::is_placeholder`].
fn matches_configured_placeholder(config: &Gate2Config, value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    config.placeholder_prefixes.iter().any(|prefix| lower.starts_with(prefix.to_ascii_lowercase().as_str()))
}

/// Truncates `value` to [`EVIDENCE_TRUNCATE_CHARS`] characters, appending an
/// ellipsis if anything was cut.
fn truncate_evidence(value: &str) -> String {
    let char_count = value.chars().count();
    if char_count <= EVIDENCE_TRUNCATE_CHARS {
        return value.to_owned();
    }
    let mut truncated: String = value.chars().take(EVIDENCE_TRUNCATE_CHARS).collect();
    truncated.push('\u{2026}');
    truncated
}

/// Applies the size-independent WARN rules: high patch risk and oversized
/// (but still parseable) diffs.
fn apply_warn_rules(diff: &str, patch_risk_levels: &[RiskLevel], config: &Gate2Config, violations: &mut Vec<Violation>) {
    if patch_risk_levels.iter().any(|level| *level == RiskLevel::High) {
        violations.push(Violation {
            rule: "high_risk_patch".to_owned(),
            severity: Severity::Warn,
            file: String::new(),
            line: None,
            message: "at least one patch self-reported high risk".to_owned(),
            evidence: String::new(),
        });
    }
    let diff_bytes = u64::try_from(diff.len()).unwrap_or(u64::MAX);
    if diff_bytes > config.large_diff_warn_bytes {
        violations.push(Violation {
            rule: "large_diff".to_owned(),
            severity: Severity::Warn,
            file: String::new(),
            line: None,
            message: format!("diff is {diff_bytes} bytes, exceeding the {}-byte warning threshold", config.large_diff_warn_bytes),
            evidence: String::new(),
        });
    }
}

/// Folds the verdict, counts violations, and assembles the final result.
fn finish(violations: Vec<Violation>, config: &Gate2Config, evaluated_at: Timestamp) -> Gate2Result {
    let verdict = Verdict::fold_severities(violations.iter().map(|v| v.severity));
    let blocking_count = u32::try_from(violations.iter().filter(|v| v.severity == Severity::Block).count()).unwrap_or(u32::MAX);
    let warning_count = u32::try_from(violations.iter().filter(|v| v.severity == Severity::Warn).count()).unwrap_or(u32::MAX);
    let summary = format!("{blocking_count} blocking, {warning_count} warning violation(s)");
    let config_snapshot = serde_json::to_value(config).unwrap_or_else(|_| json!({}));
    Gate2Result {
        verdict,
        violations,
        blocking_count,
        warning_count,
        summary,
        evidence: Gate2Evidence { policy_result: verdict, evaluated_at, config_snapshot },
    }
}

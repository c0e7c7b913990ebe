// crates/changegate-policy/src/diff.rs
// ============================================================================
// Module: Unified Diff Parser
// Description: Hand-written line-scanning parser for git-style unified diffs.
// Purpose: Turn a combined PatchSet diff into per-file touch records and a
//          flat list of added lines for the rule engine to scan.
// Dependencies: none (pure)
// ============================================================================

//! ## Overview
//! This is not a general diff library: it recognizes exactly the line shapes
//! a code host emits (`diff --git`, `index`, `new file mode`, `deleted file
//! mode`, `rename from`/`rename to`, `---`/`+++`, `@@ … @@` hunk headers) and
//! accumulates per-file records plus added-line text. Input-size and
//! per-file hunk-count ceilings are enforced before/while scanning; either
//! ceiling being exceeded is reported as [`DiffError`] rather than a silent
//! truncation, so the caller can fail closed.

use std::fmt;

/// Maximum accepted diff size, in bytes, before parsing is attempted.
pub const MAX_DIFF_BYTES: usize = 5_000_000;
/// Maximum accepted hunk count for a single file record.
pub const MAX_HUNKS_PER_FILE: usize = 500;

/// How a single file was touched by the diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    /// The file was newly created.
    Created,
    /// The file was modified in place.
    Modified,
    /// The file was deleted.
    Deleted,
}

/// One hunk header's line-count bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HunkCounts {
    /// Added lines in this hunk.
    pub added: u32,
    /// Removed lines in this hunk.
    pub removed: u32,
}

/// A single file's touch record within a parsed diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    /// The file's path after the change (its identity for rule matching).
    pub path: String,
    /// The file's path before the change, present only for renames.
    pub old_path: Option<String>,
    /// How the file was touched.
    pub action: FileAction,
    /// `true` if this record is one half of a rename.
    pub is_rename: bool,
    /// Total added lines across all hunks.
    pub additions: u32,
    /// Total removed lines across all hunks.
    pub deletions: u32,
    /// Per-hunk counts, in order.
    pub hunks: Vec<HunkCounts>,
}

/// A single added line (a `+`-prefixed line, excluding the `+++` header),
/// with its best-effort originating file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedLine {
    /// The file the line was added to.
    pub file: String,
    /// The line content, without the leading `+`.
    pub content: String,
}

/// The result of parsing a combined unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedDiff {
    /// Every file touched by the diff, in encounter order. For renames both
    /// the old and new path are considered touched by the caller.
    pub files: Vec<FileDiff>,
    /// Every added line across every file, in encounter order.
    pub added_lines: Vec<AddedLine>,
}

/// Errors raised while parsing a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffError {
    /// The diff exceeded [`MAX_DIFF_BYTES`] before parsing began.
    TooLarge {
        /// The configured ceiling.
        max_bytes: usize,
        /// The diff's actual size.
        actual_bytes: usize,
    },
    /// A single file's hunk count exceeded [`MAX_HUNKS_PER_FILE`].
    TooManyHunks {
        /// The offending file.
        file: String,
        /// The configured ceiling.
        max_hunks: usize,
        /// The file's actual hunk count.
        actual_hunks: usize,
    },
}

impl fmt::Display for DiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge { max_bytes, actual_bytes } => {
                write!(f, "diff too large: {actual_bytes} bytes exceeds ceiling of {max_bytes} bytes")
            }
            Self::TooManyHunks { file, max_hunks, actual_hunks } => {
                write!(f, "file {file} has {actual_hunks} hunks, exceeding ceiling of {max_hunks}")
            }
        }
    }
}

impl std::error::Error for DiffError {}

/// In-progress accumulator for the file record currently being scanned.
struct InProgressFile {
    /// The file's path after the change, once known.
    path: Option<String>,
    /// The file's path before the change, for renames.
    old_path: Option<String>,
    /// Whether `new file mode` was seen.
    is_new: bool,
    /// Whether `deleted file mode` was seen.
    is_deleted: bool,
    /// Whether `rename from`/`rename to` was seen.
    is_rename: bool,
    /// Accumulated hunks.
    hunks: Vec<HunkCounts>,
}

impl InProgressFile {
    /// Starts a fresh accumulator.
    const fn new() -> Self {
        Self {
            path: None,
            old_path: None,
            is_new: false,
            is_deleted: false,
            is_rename: false,
            hunks: Vec::new(),
        }
    }

    /// Finalizes this accumulator into a [`FileDiff`], if a path was ever
    /// established.
    fn finish(self) -> Option<FileDiff> {
        let path = self.path?;
        let action = if self.is_deleted {
            FileAction::Deleted
        } else if self.is_new {
            FileAction::Created
        } else {
            FileAction::Modified
        };
        let additions = self.hunks.iter().map(|h| h.added).sum();
        let deletions = self.hunks.iter().map(|h| h.removed).sum();
        Some(FileDiff {
            path,
            old_path: self.old_path,
            action,
            is_rename: self.is_rename,
            additions,
            deletions,
            hunks: self.hunks,
        })
    }
}

/// Strips a leading `a/` or `b/` diff path prefix, if present.
fn strip_ab_prefix(path: &str) -> &str {
    path.strip_prefix("a/").or_else(|| path.strip_prefix("b/")).unwrap_or(path)
}

/// Parses a `diff --git a/… b/…` header, returning the `b/` (new) path.
fn parse_diff_git_line(line: &str) -> Option<String> {
    let rest = line.strip_prefix("diff --git ")?;
    let b_index = rest.find(" b/")?;
    let b_path = &rest[b_index + 3..];
    Some(b_path.to_owned())
}

/// Parses `rename from X`.
fn parse_rename_from(line: &str) -> Option<String> {
    line.strip_prefix("rename from ").map(str::to_owned)
}

/// Parses `rename to Y`.
fn parse_rename_to(line: &str) -> Option<String> {
    line.strip_prefix("rename to ").map(str::to_owned)
}

/// Parses an `@@ -a,b +c,d @@` hunk header. Missing `,len` defaults to 1.
fn is_hunk_header(line: &str) -> bool {
    line.starts_with("@@ ") || line == "@@"
}

/// Returns `true` for an added-content line (`+`-prefixed), excluding the
/// `+++` file header.
fn is_added_content_line(line: &str) -> bool {
    line.starts_with('+') && !line.starts_with("+++")
}

/// Parses a combined unified diff into per-file records and added lines.
///
/// # Errors
///
/// Returns [`DiffError::TooLarge`] if `diff` exceeds [`MAX_DIFF_BYTES`], or
/// [`DiffError::TooManyHunks`] if any single file exceeds
/// [`MAX_HUNKS_PER_FILE`].
pub fn parse_diff(diff: &str) -> Result<ParsedDiff, DiffError> {
    if diff.len() > MAX_DIFF_BYTES {
        return Err(DiffError::TooLarge {
            max_bytes: MAX_DIFF_BYTES,
            actual_bytes: diff.len(),
        });
    }

    let mut result = ParsedDiff::default();
    let mut current: Option<InProgressFile> = None;

    for raw_line in diff.lines() {
        if let Some(new_path) = parse_diff_git_line(raw_line) {
            if let Some(file) = current.take() {
                flush_file(file, &mut result);
            }
            let mut file = InProgressFile::new();
            file.path = Some(strip_ab_prefix(&new_path).to_owned());
            current = Some(file);
            continue;
        }

        let Some(file) = current.as_mut() else { continue };

        if raw_line.starts_with("new file mode") {
            file.is_new = true;
        } else if raw_line.starts_with("deleted file mode") {
            file.is_deleted = true;
        } else if let Some(old) = parse_rename_from(raw_line) {
            file.old_path = Some(old);
            file.is_rename = true;
        } else if let Some(new_name) = parse_rename_to(raw_line) {
            file.path = Some(new_name);
            file.is_rename = true;
        } else if raw_line.starts_with("--- ") || raw_line.starts_with("+++ ") {
            // Path identity already established from the diff --git line.
        } else if is_hunk_header(raw_line) {
            if file.hunks.len() >= MAX_HUNKS_PER_FILE {
                let path = file.path.clone().unwrap_or_default();
                return Err(DiffError::TooManyHunks {
                    file: path,
                    max_hunks: MAX_HUNKS_PER_FILE,
                    actual_hunks: file.hunks.len() + 1,
                });
            }
            file.hunks.push(HunkCounts::default());
        } else if is_added_content_line(raw_line) {
            if let Some(hunk) = file.hunks.last_mut() {
                hunk.added += 1;
            }
            let path = file.path.clone().unwrap_or_default();
            result.added_lines.push(AddedLine {
                file: path,
                content: raw_line[1..].to_owned(),
            });
        } else if raw_line.starts_with('-') && !raw_line.starts_with("---") {
            if let Some(hunk) = file.hunks.last_mut() {
                hunk.removed += 1;
            }
        }
    }

    if let Some(file) = current.take() {
        flush_file(file, &mut result);
    }

    Ok(result)
}

/// Appends a finished file accumulator to `result`, if it ever established a
/// path.
fn flush_file(file: InProgressFile, result: &mut ParsedDiff) {
    if let Some(diff) = file.finish() {
        result.files.push(diff);
    }
}

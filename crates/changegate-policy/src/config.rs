// crates/changegate-policy/src/config.rs
// ============================================================================
// Module: Gate2 Configuration
// Description: The tunable rule set Gate2 evaluates a diff against.
// Purpose: One place to describe "what a dangerous change looks like" for
//          this workspace, with sensible fail-closed defaults.
// Dependencies: serde, regex
// ============================================================================

//! ## Overview
//! [`Gate2Config::default`] mirrors the defaults the policy design calls
//! for: a short list of frozen paths, a short list of deny patterns, and
//! the dependency-file list used by the dependency-change rule. Path
//! matching (frozen files and deny globs) compiles each `*`/`?` pattern into
//! an anchored [`regex::Regex`]; `deny_keywords` entries are themselves
//! regex fragments (e.g. `private[_-]?key`), matched case-insensitively
//! against the touched path.

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

/// The size, in bytes, above which a diff triggers the `large_diff` WARN
/// rule.
const DEFAULT_LARGE_DIFF_WARN_BYTES: u64 = 10 * 1024;

/// The tunable configuration Gate2 evaluates a diff against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gate2Config {
    /// Exact or glob (`*`/`?`) path patterns that must never appear in a
    /// diff.
    pub frozen_files: Vec<String>,
    /// Glob (`*`/`?`) path patterns that must never appear in a diff.
    pub deny_globs: Vec<String>,
    /// Regex fragments that, if they match anywhere in a touched path, deny
    /// it (e.g. `secrets?`, `private[_-]?key`), matched case-insensitively.
    pub deny_keywords: Vec<String>,
    /// Placeholder patterns that suppress an otherwise-matching secret.
    pub placeholder_prefixes: Vec<String>,
    /// Filenames treated as dependency manifests/lockfiles.
    pub dependency_files: Vec<String>,
    /// When `false`, a touched dependency file is BLOCK; when `true`, WARN.
    pub allow_dependency_changes: bool,
    /// Diff size, in bytes, above which the `large_diff` WARN rule fires.
    pub large_diff_warn_bytes: u64,
}

impl Default for Gate2Config {
    fn default() -> Self {
        Self {
            frozen_files: vec![
                "Cargo.lock".to_owned(),
                "package-lock.json".to_owned(),
                "yarn.lock".to_owned(),
                "pnpm-lock.yaml".to_owned(),
                "Gemfile.lock".to_owned(),
                "poetry.lock".to_owned(),
                "LICENSE".to_owned(),
                "LICENSE.md".to_owned(),
                "LICENSE.txt".to_owned(),
                ".gitattributes".to_owned(),
                ".github/workflows/*".to_owned(),
                "Dockerfile".to_owned(),
                "CODEOWNERS".to_owned(),
            ],
            deny_globs: vec![".env*".to_owned(), "*.pem".to_owned(), "*.key".to_owned()],
            deny_keywords: vec!["secrets?".to_owned(), "credentials?".to_owned(), "private[_-]?key".to_owned(), "password".to_owned()],
            placeholder_prefixes: vec!["your_".to_owned(), "your-".to_owned()],
            dependency_files: vec![
                "package.json".to_owned(),
                "package-lock.json".to_owned(),
                "yarn.lock".to_owned(),
                "pnpm-lock.yaml".to_owned(),
                "Cargo.toml".to_owned(),
                "Cargo.lock".to_owned(),
                "go.mod".to_owned(),
                "go.sum".to_owned(),
                "Gemfile".to_owned(),
                "Gemfile.lock".to_owned(),
                "requirements.txt".to_owned(),
                "poetry.lock".to_owned(),
            ],
            allow_dependency_changes: false,
            large_diff_warn_bytes: DEFAULT_LARGE_DIFF_WARN_BYTES,
        }
    }
}

/// Compiles a glob pattern supporting `*` (any run of characters, including
/// none) and `?` (exactly one character) into an anchored [`Regex`]. No
/// other wildcard syntax is recognized; every other character is matched
/// literally.
fn compile_glob(pattern: &str) -> Regex {
    let mut source = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');
    Regex::new(&source).unwrap_or_else(|_| Regex::new(r"^\z").expect("empty-match fallback regex is valid"))
}

/// Matches `path` against a single glob pattern supporting `*` and `?`.
#[must_use]
pub fn glob_match(pattern: &str, path: &str) -> bool {
    compile_glob(pattern).is_match(path)
}

/// Returns `true` if `path` matches any entry in `patterns` (exact string or
/// `*`/`?` glob).
#[must_use]
pub fn matches_any_pattern(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|pattern| glob_match(pattern, path))
}

/// Returns `true` if any of `keywords` (regex fragments, matched
/// case-insensitively) is found anywhere in `path`.
#[must_use]
pub fn matches_any_keyword(keywords: &[String], path: &str) -> bool {
    keywords.iter().any(|keyword| Regex::new(&format!("(?i){keyword}")).is_ok_and(|pattern| pattern.is_match(path)))
}

#[cfg(test)]
mod tests {
    use super::Gate2Config;
    use super::glob_match;
    use super::matches_any_keyword;
    use super::matches_any_pattern;

    #[test]
    fn glob_star_matches_nested_paths() {
        assert!(glob_match(".github/workflows/*", ".github/workflows/ci.yml"));
        assert!(!glob_match(".github/workflows/*", ".github/dependabot.yml"));
    }

    #[test]
    fn glob_without_wildcard_is_exact() {
        assert!(glob_match("Cargo.lock", "Cargo.lock"));
        assert!(!glob_match("Cargo.lock", "sub/Cargo.lock"));
    }

    #[test]
    fn defaults_include_frozen_workflow_glob() {
        let config = Gate2Config::default();
        assert!(matches_any_pattern(&config.frozen_files, ".github/workflows/ci.yml"));
    }

    #[test]
    fn deny_keywords_match_case_insensitively() {
        let config = Gate2Config::default();
        assert!(matches_any_keyword(&config.deny_keywords, "infra/SECRET_rotation.sh"));
    }

    #[test]
    fn deny_keywords_match_private_key_without_a_separator() {
        let config = Gate2Config::default();
        assert!(matches_any_keyword(&config.deny_keywords, "infra/privatekey.pem"));
    }
}

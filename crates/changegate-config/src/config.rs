// crates/changegate-config/src/config.rs
// ============================================================================
// Module: Changegate Configuration
// Description: Configuration loading and validation for Changegate.
// Purpose: Provide strict, fail-closed config parsing with an env overlay.
// Dependencies: changegate-core, changegate-policy, serde, toml, thiserror
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file, then overlaid with
//! `CHANGEGATE_`-prefixed environment variables, then validated as a whole.
//! Missing or invalid configuration fails closed: a bad deployment should
//! never start with a partially-valid config.

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use changegate_policy::config::Gate2Config;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable used to override the config file path.
pub const CHANGEGATE_CONFIG_ENV_VAR: &str = "CHANGEGATE_CONFIG";

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "changegate.toml";
/// Maximum configuration file size in bytes.
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;
/// Maximum total path length accepted for a config path.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;

/// The fully merged, validated configuration for one Changegate deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangegateConfig {
    /// Durable store connection settings.
    #[serde(default)]
    pub store: StoreConfig,
    /// Job queue connection and capacity settings.
    #[serde(default)]
    pub queues: QueuesConfig,
    /// LLM provider credential and fallback settings.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Code host credential settings.
    #[serde(default)]
    pub code_host: CodeHostConfig,
    /// Gate2 policy rule set.
    #[serde(default)]
    pub policy: Gate2Config,
    /// Cost ceilings applied to stage worker runs.
    #[serde(default)]
    pub cost: CostConfig,
    /// Enables contract-test-only behavior when running under CI.
    #[serde(default)]
    pub ci: bool,
}

impl ChangegateConfig {
    /// Loads configuration from disk, applies the environment overlay, and
    /// validates the merged result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when reading, parsing, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path)?;
        validate_path(&resolved)?;
        let metadata = fs::metadata(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid(vec![
                "config file exceeds size limit".to_owned(),
            ]));
        }
        let content = fs::read_to_string(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        let mut config: Self = toml::from_str(&content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.apply_env_overlay();
        config.validate()?;
        Ok(config)
    }

    /// Overlays `CHANGEGATE_`-prefixed environment variables onto a
    /// TOML-loaded configuration. Absent variables leave the file's value
    /// untouched.
    pub fn apply_env_overlay(&mut self) {
        self.apply_env_overlay_from(|key| env::var(key).ok());
    }

    /// Overlay implementation parameterized over a variable lookup, so the
    /// overlay logic is testable without mutating the process environment.
    fn apply_env_overlay_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("CHANGEGATE_STORE_PATH") {
            self.store.connection = value;
        }
        if let Some(value) = lookup("CHANGEGATE_QUEUE_URL") {
            self.queues.connection = value;
        }
        if let Some(value) = lookup("CHANGEGATE_LLM_API_KEY") {
            self.llm.api_key = Some(value);
        }
        if let Some(value) = lookup("CHANGEGATE_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = lookup("CHANGEGATE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = lookup("CHANGEGATE_CODE_HOST_TOKEN") {
            self.code_host.app_credential = Some(value);
        }
        if let Some(value) = lookup("CHANGEGATE_CODE_HOST_BASE_URL") {
            self.code_host.base_url = value;
        }
        if let Some(value) = lookup("CHANGEGATE_ALLOW_SUMMARY_FALLBACK") {
            self.llm.allow_summary_fallback = parse_flag(&value);
        }
        if let Some(value) = lookup("CHANGEGATE_CI") {
            self.ci = parse_flag(&value);
        }
    }

    /// Validates the configuration for internal consistency.
    ///
    /// All violated fields are collected before returning, so an operator
    /// fixes a misconfigured deployment in one pass.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing every violated field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        self.store.validate_into(&mut errors);
        self.queues.validate_into(&mut errors);
        self.cost.validate_into(&mut errors);
        if errors.is_empty() { Ok(()) } else { Err(ConfigError::Invalid(errors)) }
    }
}

/// Durable store connection settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// Store connection string (a `sqlite://` path in the reference
    /// implementation).
    #[serde(default)]
    pub connection: String,
}

impl StoreConfig {
    /// Appends validation failures to `errors` without stopping at the
    /// first.
    fn validate_into(&self, errors: &mut Vec<String>) {
        if self.connection.trim().is_empty() {
            errors.push("store.connection must be set".to_owned());
        }
    }
}

/// Job queue connection and capacity settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueuesConfig {
    /// Queue connection string.
    #[serde(default)]
    pub connection: String,
    /// Default bounded capacity applied to a queue with no explicit
    /// override.
    #[serde(default = "default_queue_capacity")]
    pub default_capacity: usize,
    /// Per-queue capacity overrides, keyed by queue name.
    #[serde(default)]
    pub capacities: std::collections::BTreeMap<String, usize>,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            connection: String::new(),
            default_capacity: default_queue_capacity(),
            capacities: std::collections::BTreeMap::new(),
        }
    }
}

/// Default bounded capacity for a queue with no explicit override.
const fn default_queue_capacity() -> usize {
    256
}

impl QueuesConfig {
    /// Appends validation failures to `errors` without stopping at the
    /// first.
    fn validate_into(&self, errors: &mut Vec<String>) {
        if self.connection.trim().is_empty() {
            errors.push("queues.connection must be set".to_owned());
        }
        if self.default_capacity == 0 {
            errors.push("queues.default_capacity must be non-zero".to_owned());
        }
        for (name, capacity) in &self.capacities {
            if *capacity == 0 {
                errors.push(format!("queues.capacities.{name} must be non-zero"));
            }
        }
    }
}

/// LLM provider credential and fallback settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// The API key used by the HTTP-backed LLM provider. When absent, the
    /// provider registry selects a stub provider instead.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL of the chat-completions endpoint the HTTP-backed provider
    /// calls.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Model identifier sent with every chat-completion request.
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Whether a stage worker may fall back to an unvalidated LLM response
    /// after one failed in-process retry, rather than failing the run.
    #[serde(default)]
    pub allow_summary_fallback: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self { api_key: None, base_url: default_llm_base_url(), model: default_llm_model(), allow_summary_fallback: false }
    }
}

/// Default chat-completions endpoint for the HTTP-backed LLM provider.
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_owned()
}

/// Default model identifier for the HTTP-backed LLM provider.
fn default_llm_model() -> String {
    "gpt-4o-mini".to_owned()
}

/// Code host credential settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CodeHostConfig {
    /// The app credential used by the HTTP-backed code host client.
    #[serde(default)]
    pub app_credential: Option<String>,
    /// Base URL of the code host REST API.
    #[serde(default = "default_code_host_base_url")]
    pub base_url: String,
}

impl Default for CodeHostConfig {
    fn default() -> Self {
        Self { app_credential: None, base_url: default_code_host_base_url() }
    }
}

/// Default base URL for the HTTP-backed code host client.
fn default_code_host_base_url() -> String {
    "https://api.github.com".to_owned()
}

/// Cost ceilings applied to stage worker runs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CostConfig {
    /// Maximum LLM tokens a single stage run may consume. `None` means
    /// unbounded.
    #[serde(default)]
    pub max_tokens_per_run: Option<u64>,
    /// Maximum cost, in US dollars, a single stage run may incur. `None`
    /// means unbounded.
    #[serde(default)]
    pub max_usd_per_run: Option<f64>,
}

impl CostConfig {
    /// Appends validation failures to `errors` without stopping at the
    /// first.
    fn validate_into(&self, errors: &mut Vec<String>) {
        if self.max_tokens_per_run == Some(0) {
            errors.push("cost.max_tokens_per_run must be greater than zero when set".to_owned());
        }
        if let Some(ceiling) = self.max_usd_per_run {
            if ceiling <= 0.0 {
                errors.push("cost.max_usd_per_run must be greater than zero when set".to_owned());
            }
        }
    }
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// One or more fields failed validation.
    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Resolves the config path from an explicit argument, the environment, or
/// the default filename, in that order.
fn resolve_path(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    if let Ok(env_path) = env::var(CHANGEGATE_CONFIG_ENV_VAR) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid(vec!["config path exceeds max length".to_owned()]));
        }
        return Ok(PathBuf::from(env_path));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_NAME))
}

/// Validates the resolved path against a total-length limit.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid(vec!["config path exceeds max length".to_owned()]));
    }
    Ok(())
}

/// Parses a boolean-ish environment variable the way the rest of this
/// stack's feature flags are written in practice: `"1"`/`"true"` (any case)
/// are truthy, everything else is falsy.
fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true")
}

/// A minimal `changegate.toml` suitable as a starting point for a new
/// deployment. Used by the CLI's config bootstrap command.
#[must_use]
pub fn example_toml() -> &'static str {
    r#"[store]
connection = "sqlite://changegate.db"

[queues]
connection = "memory://local"
default_capacity = 256

[llm]
# api_key = "sk-..."
base_url = "https://api.openai.com/v1"
model = "gpt-4o-mini"
allow_summary_fallback = false

[code_host]
# app_credential = "..."
base_url = "https://api.github.com"

[cost]
# max_tokens_per_run = 200000
# max_usd_per_run = 5.0

ci = false
"#
}

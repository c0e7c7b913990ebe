// crates/changegate-config/src/lib.rs
// ============================================================================
// Module: Changegate Config Library
// Description: Canonical config model, layered loading, and validation.
// Purpose: Single source of truth for changegate.toml semantics.
// Dependencies: changegate-core, changegate-policy, serde, toml
// ============================================================================

//! ## Overview
//! `changegate-config` loads a base TOML file, overlays it with
//! `CHANGEGATE_`-prefixed environment variables, and validates the merged
//! result. Validation is fail-closed and aggregated: every violated field is
//! reported in one [`ConfigError::Invalid`] rather than stopping at the
//! first.

pub mod config;

pub use config::CHANGEGATE_CONFIG_ENV_VAR;
pub use config::ChangegateConfig;
pub use config::CodeHostConfig;
pub use config::ConfigError;
pub use config::CostConfig;
pub use config::LlmConfig;
pub use config::QueuesConfig;
pub use config::StoreConfig;
pub use config::example_toml;

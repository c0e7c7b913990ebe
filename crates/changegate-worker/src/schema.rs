// crates/changegate-worker/src/schema.rs
// ============================================================================
// Module: Stage Artifact Schemas
// Description: Compiles and applies the per-stage JSON Schema documents that
//              validate an LLM-backed stage's parsed artifact.
// Purpose: One compiled validator per stage, built once at startup, reused
//          for every job; validation errors come from the schema validator
//          itself rather than a hand-rolled shape check.
// Dependencies: changegate-core, jsonschema, serde_json
// ============================================================================

//! ## Overview
//! Each LLM-backed stage (feasibility, architecture, timeline, summary,
//! patches) has one JSON Schema document describing its artifact shape.
//! [`SchemaRegistry::compile`] builds every [`jsonschema::Validator`] once;
//! [`SchemaRegistry::validate`] is the single call site step 4 of the
//! artifact production sub-protocol uses, and its returned error list is
//! fed verbatim into the retry prompt in step 5.

use std::collections::HashMap;

use changegate_core::identifiers::StageName;
use jsonschema::Validator;
use serde_json::Value;
use thiserror::Error;

/// Errors raised while compiling or applying a stage schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A schema document itself failed to compile.
    #[error("schema for stage {stage} failed to compile: {message}")]
    Invalid {
        /// The offending stage.
        stage: String,
        /// The compiler's error message.
        message: String,
    },
    /// No schema is registered for the requested stage.
    #[error("no schema registered for stage {0}")]
    NoSchemaForStage(String),
}

/// One schema-validation failure, in a shape suitable for embedding in a
/// retry prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    /// The JSON pointer path of the offending value.
    pub path: String,
    /// The validator's message.
    pub message: String,
}

/// Compiled per-stage JSON Schema validators.
pub struct SchemaRegistry {
    /// Compiled validators keyed by stage.
    validators: HashMap<StageName, Validator>,
}

impl SchemaRegistry {
    /// Compiles every `(stage, schema)` pair. Intended to run once at
    /// process startup.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Invalid`] if any schema document fails to
    /// compile.
    pub fn compile(schemas: &[(StageName, Value)]) -> Result<Self, SchemaError> {
        let mut validators = HashMap::new();
        for (stage, schema) in schemas {
            let validator = jsonschema::validator_for(schema)
                .map_err(|err| SchemaError::Invalid { stage: stage.as_str().to_owned(), message: err.to_string() })?;
            validators.insert(*stage, validator);
        }
        Ok(Self { validators })
    }

    /// Validates `instance` against the schema registered for `stage`,
    /// returning every violation found (empty if valid).
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::NoSchemaForStage`] if `stage` has no
    /// registered schema.
    pub fn validate(&self, stage: StageName, instance: &Value) -> Result<Vec<ValidationFailure>, SchemaError> {
        let validator = self.validators.get(&stage).ok_or_else(|| SchemaError::NoSchemaForStage(stage.as_str().to_owned()))?;
        let failures = validator
            .iter_errors(instance)
            .map(|error| ValidationFailure { path: error.instance_path.to_string(), message: error.to_string() })
            .collect();
        Ok(failures)
    }
}

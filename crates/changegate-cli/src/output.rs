// crates/changegate-cli/src/output.rs
// ============================================================================
// Module: CLI Output Helpers
// Description: Raw stdout/stderr writers and the top-level CLI error type.
// Purpose: Keep every command's output going through `std::io::Write`
//          instead of `println!`/`eprintln!`, and give every failure path a
//          single error type with a readable message.
// Dependencies: serde_json, thiserror
// ============================================================================

//! ## Overview
//! Every subcommand prints through [`write_stdout_line`] or
//! [`write_json_value`] rather than `println!`, so the lint table's
//! `print_stdout`/`print_stderr` denial applies to this crate like any
//! other.

use std::io::Write as _;

use serde_json::Value;
use thiserror::Error;

/// The one error type every subcommand returns.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CliError {
    /// The human-readable failure description.
    pub message: String,
}

impl CliError {
    /// Wraps any displayable error as a [`CliError`].
    pub fn from_display(err: impl std::fmt::Display) -> Self {
        Self { message: err.to_string() }
    }
}

impl From<String> for CliError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for CliError {
    fn from(message: &str) -> Self {
        Self { message: message.to_owned() }
    }
}

/// The result type every subcommand returns.
pub type CliResult<T> = Result<T, CliError>;

/// Writes `line` to stdout followed by a newline.
pub fn write_stdout_line(line: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(line.as_bytes());
    let _ = stdout.write_all(b"\n");
}

/// Writes `line` to stderr followed by a newline.
pub fn write_stderr_line(line: &str) {
    let mut stderr = std::io::stderr().lock();
    let _ = stderr.write_all(line.as_bytes());
    let _ = stderr.write_all(b"\n");
}

/// Writes `value` to stdout as pretty-printed JSON.
pub fn write_json_value(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => write_stdout_line(&rendered),
        Err(err) => write_stderr_line(&format!("failed to render output as json: {err}")),
    }
}

/// Writes `err` to stderr in a uniform `"error: {message}"` shape.
pub fn emit_error(err: &CliError) {
    write_stderr_line(&format!("error: {}", err.message));
}

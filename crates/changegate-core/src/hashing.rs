// crates/changegate-core/src/hashing.rs
// ============================================================================
// Module: Canonical JSON Hashing
// Description: Canonicalization and content-addressed hashing shared by the
//              Run Recorder's inputHash and every Artifact's contentSha.
// Purpose: One canonicalizer, one hasher, used everywhere a reproducible
//          digest over structured data is required.
// Dependencies: serde, serde_jcs, sha2
// ============================================================================

//! ## Overview
//! Canonical JSON is produced via a JSON Canonicalization Scheme (RFC
//! 8785-style) serializer: object keys sorted lexicographically, no
//! insignificant whitespace, array order preserved. Hashing is SHA-256 over
//! the canonical bytes, hex-encoded. This module is the single source of
//! truth for `contentSha` (artifacts) and `inputHash` (runs); both call the
//! same two functions below.
//!
//! Security posture: callers pass untrusted structured data (LLM-sourced
//! artifact content, run inputs); canonicalization must fail closed on
//! non-serializable input rather than silently hashing a partial
//! representation.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors returned while canonicalizing or hashing structured data.
///
/// # Invariants
/// - Never exposes the offending payload in the error message.
#[derive(Debug, Error)]
pub enum HashingError {
    /// The value could not be serialized to canonical JSON.
    #[error("failed to canonicalize value: {0}")]
    Canonicalize(String),
}

// ============================================================================
// SECTION: Digest
// ============================================================================

/// A content digest paired with the algorithm that produced it.
///
/// # Invariants
/// - `value` is lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashDigest {
    /// Hex-encoded digest value.
    pub value: String,
    /// Algorithm label, currently always `"sha256"`.
    pub algorithm: &'static str,
}

/// The hash algorithm used throughout this crate.
pub const DEFAULT_HASH_ALGORITHM: &str = "sha256";

// ============================================================================
// SECTION: Canonicalization
// ============================================================================

/// Serializes `value` to canonical JSON bytes (RFC 8785 JSON Canonicalization
/// Scheme): object keys sorted lexicographically, array order preserved, no
/// insignificant whitespace.
///
/// # Errors
///
/// Returns [`HashingError::Canonicalize`] if `value` cannot be serialized.
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, HashingError> {
    serde_jcs::to_vec(value).map_err(|err| HashingError::Canonicalize(err.to_string()))
}

/// Computes a digest over raw bytes using [`DEFAULT_HASH_ALGORITHM`].
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> HashDigest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    HashDigest {
        value: hex_encode(&digest),
        algorithm: DEFAULT_HASH_ALGORITHM,
    }
}

/// Canonicalizes `value` and computes its content digest in one step.
///
/// # Errors
///
/// Returns [`HashingError::Canonicalize`] if `value` cannot be serialized.
pub fn hash_canonical_json<T: Serialize>(value: &T) -> Result<HashDigest, HashingError> {
    let bytes = canonical_json_bytes(value)?;
    Ok(hash_bytes(&bytes))
}

/// Hex-encodes a byte slice without pulling in a dedicated hex crate.
fn hex_encode(bytes: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let byte = *byte;
        out.push(HEX_CHARS[usize::from(byte >> 4)] as char);
        out.push(HEX_CHARS[usize::from(byte & 0x0f)] as char);
    }
    out
}

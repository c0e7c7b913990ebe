// crates/changegate-core/src/time.rs
// ============================================================================
// Module: Caller-Supplied Timestamps
// Description: Timestamp representation used by pure core functions.
// Purpose: Keep wall-clock reads out of the transition function and the
//          policy engine; every timestamp the core touches is supplied by the
//          caller.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! The core engine never reads wall-clock time directly. Hosts (the worker
//! framework, the orchestrator, the CLI) must supply timestamps explicitly
//! when calling into pure functions, and carry them on events/artifacts they
//! persist. This keeps `transition`, `evaluateGate2`, and the canonicalizer
//! referentially transparent.

use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// A caller-supplied point in time, expressed as milliseconds since the Unix
/// epoch.
///
/// # Invariants
/// - Always non-negative in practice; negative values are accepted but
///   callers should not construct them outside of testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from milliseconds since the Unix epoch.
    #[must_use]
    pub const fn from_unix_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the Unix epoch.
    #[must_use]
    pub const fn as_unix_millis(self) -> i64 {
        self.0
    }

    /// Returns the duration in milliseconds between `self` and an earlier
    /// `start`, clamped to zero if `self` precedes `start`.
    #[must_use]
    pub fn saturating_duration_since_ms(self, start: Self) -> u64 {
        u64::try_from(self.0.saturating_sub(start.0)).unwrap_or(0)
    }

    /// Renders the timestamp as an RFC 3339 string for logs and events,
    /// falling back to the raw millisecond count if it falls outside the
    /// range `OffsetDateTime` can represent.
    #[must_use]
    pub fn to_rfc3339(self) -> String {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000_000)
            .ok()
            .and_then(|dt| dt.format(&Rfc3339).ok())
            .unwrap_or_else(|| self.0.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::Timestamp;

    #[test]
    fn duration_since_clamps_to_zero_when_reversed() {
        let earlier = Timestamp::from_unix_millis(1_000);
        let later = Timestamp::from_unix_millis(500);
        assert_eq!(earlier.saturating_duration_since_ms(later), 0);
    }

    #[test]
    fn duration_since_computes_forward_delta() {
        let start = Timestamp::from_unix_millis(1_000);
        let end = Timestamp::from_unix_millis(1_750);
        assert_eq!(end.saturating_duration_since_ms(start), 750);
    }

    #[test]
    fn rfc3339_round_trips_through_the_epoch() {
        let epoch = Timestamp::from_unix_millis(0);
        assert_eq!(epoch.to_rfc3339(), "1970-01-01T00:00:00Z");
    }
}

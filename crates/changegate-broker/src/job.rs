// crates/changegate-broker/src/job.rs
// ============================================================================
// Module: Job Envelope
// Description: The unit of work delivered from the publish side of a queue
//              to its subscriber.
// Dependencies: serde_json
// ============================================================================

use serde_json::Value;

/// One enqueued job, as delivered to a queue's subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// The queue this job was published to.
    pub queue: String,
    /// The job payload, as published.
    pub payload: Value,
    /// The idempotency key the publisher supplied, if any.
    pub idempotency_key: Option<String>,
}

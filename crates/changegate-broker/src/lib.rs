// crates/changegate-broker/src/lib.rs
// ============================================================================
// Module: In-Process Queue Broker
// Description: A `changegate_core::interfaces::Queues` implementation backed
//              by per-queue in-memory channels, plus the subscription side a
//              stage worker uses to consume its one named queue.
// Purpose: Give the orchestrator and workers a runnable job-queue runtime for
//          a single process without depending on an external broker.
// Dependencies: changegate-core, tokio, tokio-stream
// ============================================================================

//! ## Overview
//! [`QueueBrokerBuilder`] registers one bounded channel per named queue, the
//! same "register a handler by name, dispatch by name" shape this lineage
//! uses for mapping URI schemes to payload sources, applied here to mapping
//! queue names to channels. [`InMemoryQueues`] is the publish side
//! (implements [`changegate_core::interfaces::Queues`]); [`QueueSubscriptions`]
//! is the consume side a worker takes ownership of for its one queue.
//!
//! Enqueue calls carrying an idempotency key are deduplicated per queue: a
//! key already seen is a silent no-op rather than a duplicate delivery, per
//! the at-least-once delivery model described for this system. This is an
//! in-process broker; a deployment that needs cross-process delivery swaps
//! this crate for one backed by a real broker without touching the `Queues`
//! trait boundary.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(missing_docs_in_private_items)]

mod job;
mod registry;

pub use job::Job;
pub use registry::InMemoryQueues;
pub use registry::QueueBrokerBuilder;
pub use registry::QueueSubscriptions;

// crates/changegate-broker/src/registry.rs
// ============================================================================
// Module: Queue Registry and In-Memory Broker
// Description: Builder that registers named queues as bounded channels, the
//              publish-side `Queues` implementation, and the subscription
//              handles workers consume.
// Purpose: Provide a minimal, fully in-process queue runtime that satisfies
//          `changegate_core::interfaces::Queues` exactly.
// Dependencies: changegate-core, tokio, tokio-stream
// ============================================================================

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use changegate_core::interfaces::EnqueueOptions;
use changegate_core::interfaces::QueueError;
use changegate_core::interfaces::Queues;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::job::Job;

/// The number of distinct idempotency keys remembered per queue before the
/// oldest are evicted. Bounds the dedup table's memory use for long-running
/// processes.
const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Builds an [`InMemoryQueues`] and its matching [`QueueSubscriptions`] by
/// registering one bounded channel per named queue.
#[derive(Default)]
pub struct QueueBrokerBuilder {
    /// Channel capacity used for every newly registered queue.
    default_capacity: usize,
    /// Registered queue names in registration order.
    queues: Vec<(String, usize)>,
}

impl QueueBrokerBuilder {
    /// Creates a builder whose queues default to `default_capacity` buffered
    /// jobs each.
    #[must_use]
    pub fn new(default_capacity: usize) -> Self {
        Self { default_capacity, queues: Vec::new() }
    }

    /// Registers a queue with the builder's default capacity.
    #[must_use]
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queues.push((name.into(), self.default_capacity));
        self
    }

    /// Registers a queue with an explicit capacity, overriding the default.
    #[must_use]
    pub fn queue_with_capacity(mut self, name: impl Into<String>, capacity: usize) -> Self {
        self.queues.push((name.into(), capacity));
        self
    }

    /// Builds the broker, returning the publish side and the consume side.
    #[must_use]
    pub fn build(self) -> (InMemoryQueues, QueueSubscriptions) {
        let mut senders = BTreeMap::new();
        let mut receivers = BTreeMap::new();
        let mut dedup = BTreeMap::new();
        for (name, capacity) in self.queues {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            dedup.insert(name.clone(), Mutex::new(DedupSet::with_capacity(DEFAULT_DEDUP_CAPACITY)));
            senders.insert(name.clone(), tx);
            receivers.insert(name, rx);
        }
        (InMemoryQueues { senders: Arc::new(senders), dedup: Arc::new(dedup) }, QueueSubscriptions { receivers })
    }
}

/// A bounded, insertion-ordered set used to remember recently seen
/// idempotency keys without growing unbounded.
struct DedupSet {
    /// Membership test.
    seen: HashSet<String>,
    /// Insertion order, for FIFO eviction.
    order: VecDeque<String>,
    /// Maximum remembered keys.
    capacity: usize,
}

impl DedupSet {
    /// Creates an empty set bounded to `capacity` keys.
    fn with_capacity(capacity: usize) -> Self {
        Self { seen: HashSet::new(), order: VecDeque::new(), capacity }
    }

    /// Records `key`, returning `true` if it was already present.
    fn insert_and_check_duplicate(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.to_owned());
        self.order.push_back(key.to_owned());
        false
    }
}

/// The publish side of the in-memory broker. Implements
/// [`changegate_core::interfaces::Queues`].
pub struct InMemoryQueues {
    /// One sender per registered queue.
    senders: Arc<BTreeMap<String, mpsc::Sender<Job>>>,
    /// One idempotency-key dedup set per registered queue.
    dedup: Arc<BTreeMap<String, Mutex<DedupSet>>>,
}

#[async_trait]
impl Queues for InMemoryQueues {
    async fn enqueue(&self, queue: &str, payload: Value, options: EnqueueOptions) -> Result<(), QueueError> {
        let sender = self.senders.get(queue).ok_or_else(|| QueueError::UnknownQueue(queue.to_owned()))?;
        if let Some(key) = &options.idempotency_key {
            let dedup = self.dedup.get(queue).ok_or_else(|| QueueError::UnknownQueue(queue.to_owned()))?;
            let mut dedup = dedup.lock().await;
            if dedup.insert_and_check_duplicate(key) {
                return Ok(());
            }
        }
        let job = Job { queue: queue.to_owned(), payload, idempotency_key: options.idempotency_key };
        sender.send(job).await.map_err(|_| QueueError::Transient(format!("queue {queue} receiver dropped")))
    }
}

/// The consume side of the in-memory broker: one receiver per registered
/// queue, handed out once to the worker responsible for it.
pub struct QueueSubscriptions {
    /// Receivers keyed by queue name, removed as they are taken.
    receivers: BTreeMap<String, mpsc::Receiver<Job>>,
}

impl QueueSubscriptions {
    /// Takes ownership of the named queue's job stream. Returns `None` if
    /// the queue was never registered or has already been taken; a queue is
    /// meant to have exactly one subscriber.
    pub fn take(&mut self, queue: &str) -> Option<ReceiverStream<Job>> {
        self.receivers.remove(queue).map(ReceiverStream::new)
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;

    #[tokio::test]
    async fn enqueue_delivers_to_the_named_queue() {
        let (queues, mut subs) = QueueBrokerBuilder::new(8).queue("workflow").build();
        let mut stream = subs.take("workflow").expect("registered");

        queues.enqueue("workflow", Value::String("hello".into()), EnqueueOptions::default()).await.expect("enqueue");

        let job = stream.next().await.expect("job delivered");
        assert_eq!(job.queue, "workflow");
        assert_eq!(job.payload, Value::String("hello".into()));
    }

    #[tokio::test]
    async fn unknown_queue_is_rejected() {
        let (queues, _subs) = QueueBrokerBuilder::new(8).queue("workflow").build();
        let err = queues.enqueue("nonexistent", Value::Null, EnqueueOptions::default()).await.expect_err("unknown queue");
        assert!(matches!(err, QueueError::UnknownQueue(name) if name == "nonexistent"));
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_delivered_once() {
        let (queues, mut subs) = QueueBrokerBuilder::new(8).queue("workflow").build();
        let mut stream = subs.take("workflow").expect("registered");
        let options = EnqueueOptions { idempotency_key: Some("w1:ingest_context".to_owned()) };

        queues.enqueue("workflow", Value::Null, options.clone()).await.expect("first enqueue");
        queues.enqueue("workflow", Value::Null, options).await.expect("second enqueue is a no-op");

        drop(queues);
        let mut count = 0;
        while stream.next().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }
}

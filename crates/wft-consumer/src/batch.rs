//! Batch accumulation.
//!
//! [`BatchAccumulator::accumulate`] pulls envelopes until either the count
//! threshold or the wall-clock deadline is reached. The wait for the next
//! message is raced against the deadline, so a quiet queue still flushes a
//! partial batch on time.

use crate::queue::QueueSource;
use crate::{Error, Result};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use wft_core::EventEnvelope;

/// Envelopes collected in one accumulation pass.
///
/// Frozen once returned; the dispatcher sorts and consumes it.
#[derive(Debug, Default)]
pub struct Batch {
    envelopes: Vec<EventEnvelope>,
}

impl Batch {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            envelopes: Vec::with_capacity(capacity),
        }
    }

    pub fn from_envelopes(envelopes: Vec<EventEnvelope>) -> Self {
        Self { envelopes }
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventEnvelope> {
        self.envelopes.iter()
    }

    /// Stable sort ascending by timestamp; envelopes without one come first.
    pub fn sort_by_timestamp(&mut self) {
        self.envelopes.sort_by_key(EventEnvelope::timestamp);
    }
}

impl IntoIterator for Batch {
    type Item = EventEnvelope;
    type IntoIter = std::vec::IntoIter<EventEnvelope>;

    fn into_iter(self) -> Self::IntoIter {
        self.envelopes.into_iter()
    }
}

/// Collects envelopes into count- or time-bounded batches.
#[derive(Debug, Clone)]
pub struct BatchAccumulator {
    max_count: usize,
    max_wait: Duration,
}

impl BatchAccumulator {
    pub fn new(max_count: usize, max_wait: Duration) -> Self {
        Self {
            max_count: max_count.max(1),
            max_wait,
        }
    }

    /// Pull from `queue` until `max_count` envelopes arrive or `max_wait`
    /// elapses since the call began.
    ///
    /// Returns an empty batch when the deadline passes with nothing received.
    /// Nothing is acknowledged here except malformed messages, which never
    /// enter the batch. Fails with [`Error::SubscriptionClosed`] when the broker
    /// has ended the subscription and nothing is left to dispatch.
    pub async fn accumulate<Q>(&self, queue: &mut Q) -> Result<Batch>
    where
        Q: QueueSource + ?Sized,
    {
        let deadline = Instant::now() + self.max_wait;
        let mut batch = Batch::with_capacity(self.max_count);

        while batch.len() < self.max_count {
            let delivery = match tokio::time::timeout_at(deadline, queue.recv()).await {
                Ok(Ok(Some(delivery))) => delivery,
                Ok(Ok(None)) => {
                    if batch.is_empty() {
                        return Err(Error::SubscriptionClosed);
                    }
                    warn!(
                        "Subscription ended with {} messages pending; dispatching them",
                        batch.len()
                    );
                    break;
                }
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => {
                    debug!("Batch wait elapsed with {} messages", batch.len());
                    break;
                }
            };

            if let Some(envelope) = queue.accept(delivery).await? {
                batch.envelopes.push(envelope);
                debug!("Got a message, now we have {}", batch.len());
            }
        }

        if batch.len() == self.max_count {
            debug!("Got {}, will process", batch.len());
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory_queue;
    use chrono::{DateTime, Utc};
    use serde_json::{Value, json};
    use wft_core::DeliveryHandle;

    fn envelope(tag: u64, body: Value) -> EventEnvelope {
        let Value::Object(map) = body else {
            panic!("test body must be an object");
        };
        EventEnvelope::new(map, DeliveryHandle::new(tag))
    }

    fn order(batch: Batch) -> Vec<u64> {
        batch
            .into_iter()
            .map(|e| e.into_handle().into_tag())
            .collect()
    }

    #[test]
    fn test_sort_is_stable() {
        let mut batch = Batch::from_envelopes(vec![
            envelope(1, json!({ "date": 5 })),
            envelope(2, json!({ "date": 1 })),
            envelope(3, json!({ "date": 3 })),
            envelope(4, json!({ "date": 1 })),
        ]);
        batch.sort_by_timestamp();
        assert_eq!(order(batch), vec![2, 4, 3, 1]);
    }

    #[test]
    fn test_missing_timestamp_sorts_first() {
        let mut batch = Batch::from_envelopes(vec![
            envelope(1, json!({ "date": "2016-01-01T00:00:00Z" })),
            envelope(2, json!({})),
            envelope(3, json!({ "date": 0 })),
        ]);
        batch.sort_by_timestamp();

        let first = batch.iter().next().unwrap();
        assert_eq!(first.timestamp(), None::<DateTime<Utc>>);
        assert_eq!(order(batch), vec![2, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_trigger_returns_without_waiting() {
        let (publisher, mut queue) = memory_queue();
        for i in 0..12 {
            publisher.publish_json(&json!({ "type": "updateCard", "n": i }));
        }

        let started = Instant::now();
        let batch = BatchAccumulator::new(10, Duration::from_secs(3600))
            .accumulate(&mut queue)
            .await
            .unwrap();

        assert_eq!(batch.len(), 10);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(publisher.acked().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_flushes_partial_batch() {
        let (publisher, mut queue) = memory_queue();
        for _ in 0..3 {
            publisher.publish_json(&json!({ "type": "updateCard" }));
        }

        let started = Instant::now();
        let batch = BatchAccumulator::new(10, Duration::from_secs(1))
            .accumulate(&mut queue)
            .await
            .unwrap();

        assert_eq!(batch.len(), 3);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_nothing_returns_empty() {
        let (_publisher, mut queue) = memory_queue();
        let batch = BatchAccumulator::new(10, Duration::from_secs(15))
            .accumulate(&mut queue)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_messages_do_not_count() {
        let (publisher, mut queue) = memory_queue();
        publisher.publish(b"garbage".to_vec());
        publisher.publish_json(&json!({ "type": "a" }));
        publisher.publish_json(&json!({ "hello": "world" }));
        publisher.publish_json(&json!({ "type": "b" }));

        let batch = BatchAccumulator::new(2, Duration::from_secs(5))
            .accumulate(&mut queue)
            .await
            .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(publisher.acked(), vec![1, 3]);
        assert_eq!(order(batch), vec![2, 4]);
    }

    #[tokio::test]
    async fn test_closed_subscription() {
        let (publisher, mut queue) = memory_queue();
        publisher.publish_json(&json!({ "type": "a" }));
        drop(publisher);

        let accumulator = BatchAccumulator::new(10, Duration::from_secs(5));
        let batch = accumulator.accumulate(&mut queue).await.unwrap();
        assert_eq!(batch.len(), 1);

        assert!(matches!(
            accumulator.accumulate(&mut queue).await,
            Err(Error::SubscriptionClosed)
        ));
    }
}

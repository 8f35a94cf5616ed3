//! Queue source adapters.
//!
//! All sources implement the [`QueueSource`] trait, which gives the batch
//! accumulator and dispatcher a uniform view of a durable, explicitly
//! acknowledged work queue.
//!
//! # Available Sources
//!
//! - [`AmqpQueue`] - A durable AMQP 0.9.1 queue (RabbitMQ / CloudAMQP)
//! - [`MemoryQueue`] - An in-process queue fed through a [`MemoryPublisher`]

mod amqp;
mod memory;

pub use amqp::{AmqpConfig, AmqpQueue};
pub use memory::{MemoryPublisher, MemoryQueue, memory_queue};

use crate::Result;
use async_trait::async_trait;
use wft_core::{DeliveryHandle, EventEnvelope, parse_body};

/// A raw message as handed over by the broker.
#[derive(Debug)]
pub struct Delivery {
    pub handle: DeliveryHandle,
    pub body: Vec<u8>,
}

/// A durable work queue with explicit acknowledgment.
#[async_trait]
pub trait QueueSource: Send {
    /// Human-readable name for this source (used in logs).
    fn name(&self) -> &'static str;

    /// Wait for the next delivery.
    ///
    /// Returns `Ok(None)` once the subscription has ended. Must be cancel-safe:
    /// dropping the future before it completes loses no message, because the
    /// accumulator races it against the batch deadline.
    async fn recv(&mut self) -> Result<Option<Delivery>>;

    /// Retire one message at the broker.
    async fn ack(&mut self, handle: DeliveryHandle) -> Result<()>;

    /// Cancel the subscription and release the connection. Idempotent.
    async fn close(&mut self) -> Result<()>;

    /// Turn a delivery into an envelope.
    ///
    /// A body that is not a JSON object, or whose effective payload has no
    /// string `type`, is acknowledged right away and dropped, so a poison
    /// message can't stall the queue or take a batch slot.
    async fn accept(&mut self, delivery: Delivery) -> Result<Option<EventEnvelope>> {
        metrics::counter!("consumer_messages_received_total").increment(1);

        let rejected = match parse_body(&delivery.body) {
            Ok(body) => {
                let envelope = EventEnvelope::new(body, delivery.handle);
                if envelope.event_type().is_some() {
                    return Ok(Some(envelope));
                }
                tracing::warn!(
                    source = self.name(),
                    body = %envelope.body(),
                    "Dropping message without an event type"
                );
                envelope.into_handle()
            }
            Err(e) => {
                tracing::warn!(
                    source = self.name(),
                    error = %e,
                    body = %String::from_utf8_lossy(&delivery.body),
                    "Dropping malformed message"
                );
                delivery.handle
            }
        };

        metrics::counter!("consumer_messages_malformed_total").increment(1);
        self.ack(rejected).await?;
        metrics::counter!("consumer_messages_acked_total").increment(1);
        Ok(None)
    }
}
